use env_logger::{Builder, Target};
use log::LevelFilter;
use std::fs::File;
use std::io::Write;

pub fn setup_logger() -> Result<(), Box<dyn std::error::Error>> {
    // ログファイルを開く
    let path = std::env::var("LOG_FILE").unwrap_or_else(|_| "ip_datapath.log".to_string());
    let file = File::create(path)?;

    // ログレベルは環境変数から上書きできる
    let level = std::env::var("LOG_LEVEL")
        .ok()
        .and_then(|value| value.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::Info);

    // ビルダーでロガーをカスタマイズ
    Builder::new()
        .filter_level(level)
        // タイムスタンプ付きのフォーマット
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {} - {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.target(),  // モジュールパスが表示される
                record.args()
            )
        })
        // ファイルに出力
        .target(Target::Pipe(Box::new(file)))
        .target(Target::Stdout)
        .init();

    Ok(())
}
