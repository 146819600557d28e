use crate::net::icmp::{self, IcmpSender};
use crate::net::ipv4_header::Ipv4Header;
use log::debug;
use std::net::Ipv4Addr;
use std::sync::Arc;

// 上位プロトコルハンドラー (外部コラボレーター)
// プロトコル番号ごとに登録され、受け取ったかどうかを返す
pub trait ProtocolHandler: Send + Sync {
    fn protocol(&self) -> u8;
    fn handle(&self, datagram: Vec<u8>, header: &Ipv4Header, device_name: &str) -> bool;
}

// rawソケット配送先 (外部コラボレーター)
pub trait RawSink: Send + Sync {
    fn matches(&self, protocol: u8, source: Ipv4Addr, destination: Ipv4Addr) -> bool;
    fn deliver(&self, datagram: &[u8], header: &Ipv4Header, device_name: &str);
}

// ローカル配送ディスパッチャー
// 完全なデータグラムをrawソケットとプロトコルハンドラーへ振り分ける
pub struct LocalDelivery {
    handlers: Vec<Arc<dyn ProtocolHandler>>,
    raw_sinks: Vec<Arc<dyn RawSink>>,
}

impl LocalDelivery {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
            raw_sinks: Vec::new(),
        }
    }

    pub fn register_handler(&mut self, handler: Arc<dyn ProtocolHandler>) {
        self.handlers.push(handler);
    }

    pub fn register_raw_sink(&mut self, sink: Arc<dyn RawSink>) {
        self.raw_sinks.push(sink);
    }

    // 検証済みの完全なデータグラムを配送する
    // バッファはどの分岐でも必ずここで消費される
    pub fn deliver(
        &self,
        datagram: Vec<u8>,
        header: &Ipv4Header,
        device_name: &str,
        is_broadcast: bool,
        icmp: &dyn IcmpSender,
    ) {
        let mut claimed = false;

        // rawソケットには一致するものすべてへクローンを配る
        for sink in &self.raw_sinks {
            if sink.matches(header.protocol, header.source, header.destination) {
                sink.deliver(&datagram, header, device_name);
                claimed = true;
            }
        }

        let matching: Vec<&Arc<dyn ProtocolHandler>> = self
            .handlers
            .iter()
            .filter(|handler| handler.protocol() == header.protocol)
            .collect();

        // 最後の受け取り手だけが原本を受け取る (クローン回避の最適化)
        let count = matching.len();
        let mut original = Some(datagram);
        for (i, handler) in matching.into_iter().enumerate() {
            let buffer = if i + 1 == count {
                match original.take() {
                    Some(buffer) => buffer,
                    None => break,
                }
            } else {
                match original.as_ref() {
                    Some(buffer) => buffer.clone(),
                    None => break,
                }
            };
            if handler.handle(buffer, header, device_name) {
                claimed = true;
            }
        }

        if !claimed {
            debug!(
                "プロトコル{}のデータグラムを受け取るハンドラーがありません",
                header.protocol
            );
            // ブロードキャスト/マルチキャスト宛てには決して応答しない
            if !is_broadcast {
                if let Some(original) = original {
                    icmp.send(
                        &original,
                        icmp::ICMP_DEST_UNREACH,
                        icmp::ICMP_PROT_UNREACH,
                        0,
                        device_name,
                    );
                }
            }
        }
    }
}
