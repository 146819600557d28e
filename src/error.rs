use thiserror::Error;

#[derive(Error, Debug)]
pub enum InitProcessError {
    #[error("ロガーのセットアップに失敗しました: {0}")]
    LoggerError(String),

    #[error("環境変数ファイルの読み込みに失敗しました: {0}")]
    EnvFileReadError(String),

    #[error("環境変数の取得に失敗しました: {0}")]
    EnvVarError(String),

    #[error("環境変数の解析に失敗しました: {0}")]
    EnvVarParseError(String),

    #[error("デバイス選択エラー: {0}")]
    DeviceSelectionError(String),

    #[error("チャネルのオープンに失敗しました: {0}")]
    ChannelOpenError(String),
}
