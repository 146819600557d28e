use crate::engine::error::{IpError, IpResult};
use crate::net::ipv4_header::{self, Ipv4Header, FLAG_MF};
use log::debug;

// フラグメントとして意味を成す最小のペイロード幅
const MIN_FRAGMENT_PAYLOAD: usize = 8;

// MTUを超えるデータグラムをワイヤ形式通りのフラグメント列に分割する
//
// - DF指定のデータグラムは決して分割しない
// - 最終以外のチャンク長は必ず8バイトの倍数 (オフセットは8バイト単位のため)
// - オプションは全フラグメントへそのままコピーされる
// - 入力自体がMF付きフラグメントの場合、全出力チャンクもMFを保つ
pub fn fragment_datagram(
    frame: &[u8],
    header: &Ipv4Header,
    mtu: usize,
) -> IpResult<Vec<Vec<u8>>> {
    if header.dont_fragment() {
        return Err(IpError::FragmentationForbidden { mtu });
    }

    let header_len = header.header_len();
    let usable = if mtu > header_len {
        // 8バイト境界へ切り下げる (ワイヤ形式上の制約)
        (mtu - header_len) & !7
    } else {
        0
    };
    if usable < MIN_FRAGMENT_PAYLOAD {
        return Err(IpError::MtuTooSmall { mtu });
    }

    let data = &frame[header_len..header.total_length as usize];
    let base_offset = header.fragment_offset_bytes();
    let input_mf = header.more_fragments();

    let mut fragments = Vec::new();
    let mut pos = 0;

    while pos < data.len() {
        let chunk_len = usable.min(data.len() - pos);
        let is_last = pos + chunk_len == data.len();

        // ヘッダー(オプション込み)を原本から引き継ぎ、チャンクを続ける
        let mut buffer = Vec::with_capacity(header_len + chunk_len);
        buffer.extend_from_slice(&frame[..header_len]);
        buffer.extend_from_slice(&data[pos..pos + chunk_len]);

        let total_length = (header_len + chunk_len) as u16;
        buffer[2..4].copy_from_slice(&total_length.to_be_bytes());

        let offset_units = ((base_offset + pos) / 8) as u16;
        let more = input_mf || !is_last;
        let flags = if more { FLAG_MF } else { 0 };
        let flags_offset = ((flags as u16) << 13) | (offset_units & 0x1fff);
        buffer[6..8].copy_from_slice(&flags_offset.to_be_bytes());

        ipv4_header::store_checksum(&mut buffer, header_len);
        fragments.push(buffer);

        pos += chunk_len;
    }

    debug!(
        "データグラム(全長{})を{}個のフラグメントに分割しました (MTU: {})",
        header.total_length,
        fragments.len(),
        mtu
    );

    Ok(fragments)
}
