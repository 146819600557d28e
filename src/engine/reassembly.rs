use crate::net::icmp::{self, IcmpSender};
use crate::net::ipv4_header::{self, Ipv4Header};
use log::{debug, error, warn};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

// ICMPの引用に必要な、保存ヘッダーへ付け足すペイロードのバイト数
const CITATION_PAYLOAD_LEN: usize = 8;

// IPデータグラムの最大サイズ
const MAX_DATAGRAM_LEN: usize = 65535;

// フラグメントの相関キー: 4フィールドすべてが一致して初めて同一とみなす
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FragmentKey {
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub protocol: u8,
    pub identification: u16,
}

impl FragmentKey {
    pub fn from_header(header: &Ipv4Header) -> Self {
        Self {
            source: header.source,
            destination: header.destination,
            protocol: header.protocol,
            identification: header.identification,
        }
    }
}

// 受信済みフラグメント1個分
// バッファを所有し、data_startから論理長分だけが有効なデータ
// 先頭のトリムはdata_startとoffsetを進めるだけでコピーしない
struct FragmentNode {
    offset: usize,
    end: usize,
    buf: Vec<u8>,
    data_start: usize,
}

impl FragmentNode {
    fn len(&self) -> usize {
        self.end - self.offset
    }

    fn data(&self) -> &[u8] {
        &self.buf[self.data_start..self.data_start + self.len()]
    }
}

// 再構築中のデータグラム1個分のキュー
struct FragmentQueue {
    // 最初に見たフラグメントのヘッダー + 8バイト (ICMP引用用)
    saved_header: Vec<u8>,
    header_len: usize,
    // 最終フラグメント(MFなし)の終端オフセット。届くまではNone
    total_len: Option<usize>,
    // オフセット昇順のフラグメント列
    fragments: Vec<FragmentNode>,
    device_name: String,
    expires_at: Instant,
}

impl FragmentQueue {
    // 最終フラグメント到着済みで、先頭から隙間なく埋まっているか
    fn is_complete(&self) -> bool {
        let total_len = match self.total_len {
            Some(len) => len,
            None => return false,
        };

        let mut running = 0;
        for node in &self.fragments {
            if node.offset != running {
                return false;
            }
            running = node.end;
        }
        running == total_len
    }

    // 完成したキューを1個のデータグラムに結合する
    // いずれかのフラグメントが確保サイズを超える場合は破損とみなしNoneを返す
    fn glue(&self) -> Option<Vec<u8>> {
        let total_len = self.total_len?;
        let datagram_len = self.header_len + total_len;
        if datagram_len > MAX_DATAGRAM_LEN {
            return None;
        }

        let mut datagram = vec![0u8; datagram_len];
        datagram[..self.header_len].copy_from_slice(&self.saved_header[..self.header_len]);

        for node in &self.fragments {
            if self.header_len + node.end > datagram.len() {
                return None;
            }
            datagram[self.header_len + node.offset..self.header_len + node.end]
                .copy_from_slice(node.data());
        }

        // 結合後のヘッダーを完全なデータグラムとして整える
        datagram[2..4].copy_from_slice(&(datagram_len as u16).to_be_bytes());
        let df = datagram[6] & 0x40;
        datagram[6] = df;
        datagram[7] = 0;
        ipv4_header::store_checksum(&mut datagram, self.header_len);

        Some(datagram)
    }
}

// リアセンブリキュー全体の管理者
// すべての操作はエンジンの直列化ドメイン内で呼び出される
pub struct Reassembler {
    queues: HashMap<FragmentKey, FragmentQueue>,
    timeout: Duration,
    max_entries: usize,
}

impl Reassembler {
    pub fn new(timeout: Duration, max_entries: usize) -> Self {
        Self {
            queues: HashMap::new(),
            timeout,
            max_entries,
        }
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    // フラグメントを1個処理する
    // データグラムが完成した場合のみ、結合済みの完全なバッファを返す
    pub fn process_fragment(
        &mut self,
        frame: &[u8],
        header: &Ipv4Header,
        device_name: &str,
        now: Instant,
    ) -> Option<Vec<u8>> {
        let key = FragmentKey::from_header(header);
        let header_len = header.header_len();
        let offset = header.fragment_offset_bytes();
        let data_len = header.total_length as usize - header_len;
        let end = offset + data_len;

        if !self.queues.contains_key(&key) {
            self.evict_if_full();
            let citation_len = (header_len + CITATION_PAYLOAD_LEN).min(frame.len());
            self.queues.insert(
                key,
                FragmentQueue {
                    saved_header: frame[..citation_len].to_vec(),
                    header_len,
                    total_len: None,
                    fragments: Vec::new(),
                    device_name: device_name.to_string(),
                    expires_at: now + self.timeout,
                },
            );
        }

        let queue = match self.queues.get_mut(&key) {
            Some(queue) => queue,
            None => return None,
        };

        // 最終フラグメントだけが再構築後の全長を知っている
        if !header.more_fragments() {
            queue.total_len = Some(end);
        }

        // 挿入のたびにタイマーを巻き直す
        queue.expires_at = now + self.timeout;

        if end > offset {
            insert_fragment(
                &mut queue.fragments,
                offset,
                end,
                frame[..header.total_length as usize].to_vec(),
                header_len,
            );
        }

        if !queue.is_complete() {
            return None;
        }

        // 成否にかかわらずキューはここで破棄される
        let queue = self.queues.remove(&key)?;
        match queue.glue() {
            Some(datagram) => Some(datagram),
            None => {
                error!(
                    "リアセンブリの結合中に破損を検出しました: {} -> {} (id: {:#06x})",
                    key.source, key.destination, key.identification
                );
                None
            }
        }
    }

    // 非フラグメントのデータグラムが到着した場合の防御的クリーンアップ
    // 同じキーの古いキューは新しい完全なデータグラムに属し得ないため破棄する
    pub fn drop_stale(&mut self, header: &Ipv4Header) {
        let key = FragmentKey::from_header(header);
        if self.queues.remove(&key).is_some() {
            debug!(
                "完全なデータグラムの到着により古いリアセンブリキューを破棄しました (id: {:#06x})",
                key.identification
            );
        }
    }

    // 期限切れキューの破棄。各キューにつきICMP時間超過をちょうど1回送信する
    pub fn expire_stale(&mut self, now: Instant, icmp: &dyn IcmpSender) {
        let expired: Vec<FragmentKey> = self
            .queues
            .iter()
            .filter(|(_, queue)| queue.expires_at <= now)
            .map(|(key, _)| *key)
            .collect();

        for key in expired {
            if let Some(queue) = self.queues.remove(&key) {
                debug!(
                    "リアセンブリがタイムアウトしました: {} -> {} (id: {:#06x})",
                    key.source, key.destination, key.identification
                );
                icmp.send(
                    &queue.saved_header,
                    icmp::ICMP_TIME_EXCEEDED,
                    icmp::ICMP_EXC_FRAGTIME,
                    0,
                    &queue.device_name,
                );
            }
        }
    }

    // 上限到達時は最も期限の近い(=最も古い)キューを追い出す
    // タイムアウトではないのでICMPは送らない
    fn evict_if_full(&mut self) {
        if self.queues.len() < self.max_entries {
            return;
        }
        if let Some(key) = self
            .queues
            .iter()
            .min_by_key(|(_, queue)| queue.expires_at)
            .map(|(key, _)| *key)
        {
            warn!(
                "リアセンブリエントリが上限({})に達したため最古のキューを追い出します",
                self.max_entries
            );
            self.queues.remove(&key);
        }
    }
}

// オフセット順を保ったままフラグメントを挿入し、重複範囲を解決する
// 先着フラグメントの末尾は新フラグメントの先頭に勝ち、
// 新フラグメントは自分が上書きする後続フラグメントの先頭に勝つ
fn insert_fragment(
    fragments: &mut Vec<FragmentNode>,
    offset: usize,
    end: usize,
    buf: Vec<u8>,
    data_start: usize,
) {
    let mut offset = offset;
    let mut data_start = data_start;

    // 直前のフラグメントの末尾と重なる分だけ先頭を削る
    if let Some(prev) = fragments.iter().rev().find(|node| node.offset <= offset) {
        if prev.end > offset {
            let shift = prev.end - offset;
            offset += shift;
            data_start += shift;
        }
    }

    // 既存データに完全に包含されたフラグメントは捨てる (先着データの勝ち)
    if offset >= end {
        return;
    }

    // 新フラグメントが頭を踏む後続フラグメントをトリムまたは削除する
    fragments.retain_mut(|node| {
        if node.offset < offset || node.offset >= end {
            return true;
        }
        if node.end <= end {
            // 完全に覆い尽くされたので削除
            return false;
        }
        let shift = end - node.offset;
        node.offset += shift;
        node.data_start += shift;
        true
    });

    let position = fragments.partition_point(|node| node.offset < offset);
    fragments.insert(
        position,
        FragmentNode {
            offset,
            end,
            buf,
            data_start,
        },
    );
}
