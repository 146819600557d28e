use crate::net::ipv4_header::HeaderError;
use std::net::Ipv4Addr;
use thiserror::Error;

pub type IpResult<T> = Result<T, IpError>;

#[derive(Error, Debug)]
pub enum IpError {
    #[error("ヘッダー検証エラー: {0}")]
    Header(#[from] HeaderError),

    #[error("宛先への経路が見つかりません: {0}")]
    NoRoute(Ipv4Addr),

    #[error("デバイスが停止しています: {0}")]
    DeviceDown(String),

    #[error("ペイロードが大きすぎます: {0}バイト")]
    PayloadTooLong(usize),

    #[error("DF指定のためフラグメント化できません (MTU: {mtu})")]
    FragmentationForbidden { mtu: usize },

    #[error("デバイスのMTUが小さすぎます (MTU: {mtu})")]
    MtuTooSmall { mtu: usize },
}
