// ICMPメッセージのタイプとコード (RFC 792)

use crate::net::checksum;
use crate::net::device::{HeaderBuildResult, OutFrame, TxPriority};
use crate::net::ipv4_header::{self, Ipv4Header};
use crate::net::route::RouteLookup;
use log::debug;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

pub const ICMP_DEST_UNREACH: u8 = 3;
pub const ICMP_REDIRECT: u8 = 5;
pub const ICMP_TIME_EXCEEDED: u8 = 11;
pub const ICMP_PARAMETERPROB: u8 = 12;

// 宛先到達不能のコード
pub const ICMP_NET_UNREACH: u8 = 0;
pub const ICMP_HOST_UNREACH: u8 = 1;
pub const ICMP_PROT_UNREACH: u8 = 2;
pub const ICMP_FRAG_NEEDED: u8 = 4;
pub const ICMP_SR_FAILED: u8 = 5;

// 時間超過のコード
pub const ICMP_EXC_TTL: u8 = 0;
pub const ICMP_EXC_FRAGTIME: u8 = 1;

// リダイレクトのコード
pub const ICMP_REDIR_HOST: u8 = 1;

// ICMPエラー送信の抽象 (外部コラボレーター)
// 送信は投げっぱなしであり、コアは結果を検査しない
pub trait IcmpSender: Send + Sync {
    fn send(&self, original: &[u8], icmp_type: u8, code: u8, extra: u32, device_name: &str);
}

// 原本のヘッダー+8バイトを引用したICMPエラーデータグラムを組み立てて
// 経路表で選んだデバイスへ直接キューする実装
pub struct IcmpReplier {
    router: Arc<dyn RouteLookup>,
    next_id: AtomicU16,
}

impl IcmpReplier {
    pub fn new(router: Arc<dyn RouteLookup>) -> Self {
        Self {
            router,
            next_id: AtomicU16::new(rand::random()),
        }
    }

    fn is_icmp_error(original: &[u8], header: &Ipv4Header) -> bool {
        if header.protocol != 1 {
            return false;
        }
        match original.get(header.header_len()) {
            Some(&icmp_type) => matches!(
                icmp_type,
                ICMP_DEST_UNREACH | ICMP_REDIRECT | ICMP_TIME_EXCEEDED | ICMP_PARAMETERPROB
            ),
            None => false,
        }
    }
}

impl IcmpSender for IcmpReplier {
    fn send(&self, original: &[u8], icmp_type: u8, code: u8, extra: u32, device_name: &str) {
        let header = match Ipv4Header::parse(original) {
            Some(header) => header,
            None => return,
        };

        // 先頭以外のフラグメントとICMPエラー自身には応答しない (RFC 1122)
        if header.fragment_offset != 0 || Self::is_icmp_error(original, &header) {
            return;
        }

        let route = match self.router.lookup(header.source, false) {
            Some(route) => route,
            None => {
                debug!("ICMP応答の経路がありません: {}", header.source);
                return;
            }
        };
        if !route.device.is_up() {
            return;
        }

        // 引用は原本ヘッダー+先頭8バイト
        let quote_len = (header.header_len() + 8).min(original.len());
        let icmp_len = 8 + quote_len;

        let reply_header = Ipv4Header {
            version: 4,
            ihl: 5,
            tos: 0,
            total_length: (20 + icmp_len) as u16,
            identification: self.next_id.fetch_add(1, Ordering::Relaxed),
            flags: 0,
            fragment_offset: 0,
            ttl: 64,
            protocol: 1,
            checksum: 0,
            source: route.device.addr(),
            destination: header.source,
        };

        let mut frame = vec![0u8; 20 + icmp_len];
        reply_header.write_to(&mut frame);
        frame[20] = icmp_type;
        frame[21] = code;
        frame[24..28].copy_from_slice(&extra.to_be_bytes());
        frame[28..28 + quote_len].copy_from_slice(&original[..quote_len]);

        let icmp_checksum = checksum::internet_checksum(&frame[20..]);
        frame[22..24].copy_from_slice(&icmp_checksum.to_be_bytes());
        ipv4_header::store_checksum(&mut frame, 20);

        debug!(
            "ICMPエラーを送信します (タイプ: {}, コード: {}, 宛先: {}, 受信デバイス: {})",
            icmp_type, code, header.source, device_name
        );

        let next_hop = route.gateway.unwrap_or(header.source);
        let mut data = frame;
        let hw_resolved = match route.device.build_header(&mut data, next_hop) {
            HeaderBuildResult::Built(_) => true,
            HeaderBuildResult::Deferred => false,
        };
        route
            .device
            .queue_frame(OutFrame { data, hw_resolved }, TxPriority::Normal);
    }
}
