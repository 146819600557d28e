// エンジン各モジュールのテストで共有するフェイクコラボレーターと
// フレーム組み立てヘルパー

use crate::engine::deliver::{ProtocolHandler, RawSink};
use crate::net::device::{HeaderBuildResult, NetDevice, OutFrame, TxPriority};
use crate::net::icmp::IcmpSender;
use crate::net::ipv4_header::{self, Ipv4Header};
use ipnetwork::Ipv4Network;
use std::net::Ipv4Addr;
use std::sync::Mutex;

// 指定フィールドでテスト用フレームを組み立てる (チェックサムは正しく計算する)
pub fn make_frame(
    source: Ipv4Addr,
    destination: Ipv4Addr,
    identification: u16,
    protocol: u8,
    ttl: u8,
    flags: u8,
    fragment_offset: u16,
    payload: &[u8],
) -> Vec<u8> {
    let header = Ipv4Header {
        version: 4,
        ihl: 5,
        tos: 0,
        total_length: (20 + payload.len()) as u16,
        identification,
        flags,
        fragment_offset,
        ttl,
        protocol,
        checksum: 0,
        source,
        destination,
    };

    let mut frame = vec![0u8; 20 + payload.len()];
    header.write_to(&mut frame);
    frame[20..].copy_from_slice(payload);
    ipv4_header::store_checksum(&mut frame, 20);
    frame
}

// ペイロードをchunk_sizeごとのフラグメント列にする (chunk_sizeは8の倍数)
pub fn make_fragment_frames(
    source: Ipv4Addr,
    destination: Ipv4Addr,
    identification: u16,
    payload: &[u8],
    chunk_size: usize,
) -> Vec<Vec<u8>> {
    assert_eq!(chunk_size % 8, 0);

    let mut frames = Vec::new();
    let mut pos = 0;
    while pos < payload.len() {
        let len = chunk_size.min(payload.len() - pos);
        let is_last = pos + len == payload.len();
        let flags = if is_last { 0 } else { 0b001 };
        frames.push(make_frame(
            source,
            destination,
            identification,
            17,
            64,
            flags,
            (pos / 8) as u16,
            &payload[pos..pos + len],
        ));
        pos += len;
    }
    frames
}

// 送信されたICMPを記録するフェイク
pub struct RecordingIcmp {
    sent: Mutex<Vec<(u8, u8, u32, String)>>,
}

impl RecordingIcmp {
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn last_sent(&self) -> Option<(u8, u8)> {
        self.sent
            .lock()
            .unwrap()
            .last()
            .map(|(icmp_type, code, _, _)| (*icmp_type, *code))
    }

    pub fn last_extra(&self) -> Option<u32> {
        self.sent.lock().unwrap().last().map(|(_, _, extra, _)| *extra)
    }
}

impl IcmpSender for RecordingIcmp {
    fn send(&self, _original: &[u8], icmp_type: u8, code: u8, extra: u32, device_name: &str) {
        self.sent
            .lock()
            .unwrap()
            .push((icmp_type, code, extra, device_name.to_string()));
    }
}

// 送信フレームを記録するフェイクデバイス
pub struct TestDevice {
    pub name: String,
    pub mtu: usize,
    pub up: bool,
    pub addr: Ipv4Addr,
    pub network: Option<Ipv4Network>,
    pub defer_header: bool,
    sent: Mutex<Vec<(OutFrame, TxPriority)>>,
}

impl TestDevice {
    pub fn new(name: &str, mtu: usize, addr: Ipv4Addr, prefix: u8) -> Self {
        Self {
            name: name.to_string(),
            mtu,
            up: true,
            addr,
            network: Some(Ipv4Network::new(addr, prefix).unwrap()),
            defer_header: false,
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn down(mut self) -> Self {
        self.up = false;
        self
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(frame, _)| frame.data.clone())
            .collect()
    }

    pub fn sent_priorities(&self) -> Vec<TxPriority> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(_, priority)| *priority)
            .collect()
    }

    pub fn sent_states(&self) -> Vec<bool> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(frame, _)| frame.hw_resolved)
            .collect()
    }
}

impl NetDevice for TestDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    fn is_up(&self) -> bool {
        self.up
    }

    fn addr(&self) -> Ipv4Addr {
        self.addr
    }

    fn network(&self) -> Option<Ipv4Network> {
        self.network
    }

    fn build_header(&self, _frame: &mut Vec<u8>, _dest: Ipv4Addr) -> HeaderBuildResult {
        if self.defer_header {
            HeaderBuildResult::Deferred
        } else {
            HeaderBuildResult::Built(0)
        }
    }

    fn queue_frame(&self, frame: OutFrame, priority: TxPriority) {
        self.sent.lock().unwrap().push((frame, priority));
    }
}

// 受信を記録するプロトコルハンドラー
pub struct RecordingHandler {
    protocol: u8,
    received: Mutex<Vec<Vec<u8>>>,
}

impl RecordingHandler {
    pub fn new(protocol: u8) -> Self {
        Self {
            protocol,
            received: Mutex::new(Vec::new()),
        }
    }

    pub fn received_count(&self) -> usize {
        self.received.lock().unwrap().len()
    }

    pub fn last_received(&self) -> Option<Vec<u8>> {
        self.received.lock().unwrap().last().cloned()
    }
}

impl ProtocolHandler for RecordingHandler {
    fn protocol(&self) -> u8 {
        self.protocol
    }

    fn handle(&self, datagram: Vec<u8>, _header: &Ipv4Header, _device_name: &str) -> bool {
        self.received.lock().unwrap().push(datagram);
        true
    }
}

// 受信を記録するrawソケット
pub struct RecordingRawSink {
    protocol: u8,
    received: Mutex<Vec<Vec<u8>>>,
}

impl RecordingRawSink {
    pub fn new(protocol: u8) -> Self {
        Self {
            protocol,
            received: Mutex::new(Vec::new()),
        }
    }

    pub fn received_count(&self) -> usize {
        self.received.lock().unwrap().len()
    }
}

impl RawSink for RecordingRawSink {
    fn matches(&self, protocol: u8, _source: Ipv4Addr, _destination: Ipv4Addr) -> bool {
        protocol == self.protocol
    }

    fn deliver(&self, datagram: &[u8], _header: &Ipv4Header, _device_name: &str) {
        self.received.lock().unwrap().push(datagram.to_vec());
    }
}
