use crate::net::ipv4_header::{TOS_LOW_DELAY, TOS_THROUGHPUT};
use ipnetwork::Ipv4Network;
use std::net::Ipv4Addr;

// デバイス送信キューの優先度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxPriority {
    Interactive,
    Normal,
    Background,
}

impl TxPriority {
    // TOSフィールドから送信優先度を選択する
    pub fn from_tos(tos: u8) -> Self {
        if tos & TOS_LOW_DELAY != 0 {
            TxPriority::Interactive
        } else if tos & TOS_THROUGHPUT != 0 {
            TxPriority::Background
        } else {
            TxPriority::Normal
        }
    }
}

// リンク層ヘッダー構築の結果
// DeferredはARP解決待ちを意味し、フレームは後でハードウェアアドレスを
// 再構築する必要があるものとして印を付けたままキューに入れる
pub enum HeaderBuildResult {
    Built(usize),
    Deferred,
}

// 送信デバイスへ渡すフレーム
#[derive(Debug, Clone)]
pub struct OutFrame {
    pub data: Vec<u8>,
    pub hw_resolved: bool,
}

// ネットワークデバイスの抽象 (ルーティング・送信コラボレーター)
pub trait NetDevice: Send + Sync {
    fn name(&self) -> &str;
    fn mtu(&self) -> usize;
    fn is_up(&self) -> bool;
    fn addr(&self) -> Ipv4Addr;
    fn network(&self) -> Option<Ipv4Network>;

    // リンク層ヘッダーをフレーム先頭に構築する
    fn build_header(&self, frame: &mut Vec<u8>, dest: Ipv4Addr) -> HeaderBuildResult;

    // 完成したフレームを送信キューへ入れる
    fn queue_frame(&self, frame: OutFrame, priority: TxPriority);
}
