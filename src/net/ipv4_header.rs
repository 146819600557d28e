use crate::net::checksum;
use std::net::Ipv4Addr;
use thiserror::Error;

// 0                   1                   2                   3
// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |Version|  IHL  |Type of Service|          Total Length         |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |         Identification        |Flags|      Fragment Offset    |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |  Time to Live |    Protocol   |         Header Checksum       |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                       Source Address                          |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                    Destination Address                        |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+

pub const MIN_HEADER_LEN: usize = 20;

// フラグビット (3ビットフィールド内の位置)
pub const FLAG_DF: u8 = 0b010;
pub const FLAG_MF: u8 = 0b001;

// TOSビット (送信優先度の選択に使用)
pub const TOS_LOW_DELAY: u8 = 0x10;
pub const TOS_THROUGHPUT: u8 = 0x08;

// 最小限のオプション解析で扱うオプション番号
const OPT_END: u8 = 0;
const OPT_NOP: u8 = 1;
const OPT_LSRR: u8 = 0x83;
const OPT_SSRR: u8 = 0x89;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum HeaderError {
    #[error("バッファがIPヘッダーの最小長より短いです")]
    TooShort,

    #[error("IPバージョンが不正です: {0}")]
    BadVersion(u8),

    #[error("ヘッダー長が不正です: {0}ワード")]
    BadHeaderLength(u8),

    #[error("ヘッダーチェックサムが一致しません")]
    BadChecksum,

    #[error("合計長({total_length})が受信バッファ長({actual})を超えています")]
    LengthMismatch { total_length: u16, actual: usize },

    #[error("オプションの形式が不正です (ヘッダー内オフセット: {pointer})")]
    BadOption { pointer: u8 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Header {
    pub version: u8,
    pub ihl: u8,
    pub tos: u8,
    pub total_length: u16,
    pub identification: u16,
    pub flags: u8,
    pub fragment_offset: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: u16,
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
}

// ソースルーティングオプションから導出される転送時の補助情報
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceRoute {
    pub strict: bool,
    pub alt_target: Option<Ipv4Addr>,
}

impl Ipv4Header {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < MIN_HEADER_LEN {
            return None;
        }

        Some(Self {
            version: (data[0] >> 4) & 0xf,
            ihl: data[0] & 0xf,
            tos: data[1],
            total_length: u16::from_be_bytes([data[2], data[3]]),
            identification: u16::from_be_bytes([data[4], data[5]]),
            flags: (data[6] >> 5) & 0x7,
            fragment_offset: u16::from_be_bytes([data[6] & 0x1f, data[7]]),
            ttl: data[8],
            protocol: data[9],
            checksum: u16::from_be_bytes([data[10], data[11]]),
            source: Ipv4Addr::new(data[12], data[13], data[14], data[15]),
            destination: Ipv4Addr::new(data[16], data[17], data[18], data[19]),
        })
    }

    // ヘッダー長 (バイト単位)
    pub fn header_len(&self) -> usize {
        self.ihl as usize * 4
    }

    pub fn dont_fragment(&self) -> bool {
        self.flags & FLAG_DF != 0
    }

    pub fn more_fragments(&self) -> bool {
        self.flags & FLAG_MF != 0
    }

    // フラグメントオフセット (バイト単位、ワイヤ上は8バイト単位)
    pub fn fragment_offset_bytes(&self) -> usize {
        self.fragment_offset as usize * 8
    }

    pub fn is_fragment(&self) -> bool {
        self.more_fragments() || self.fragment_offset != 0
    }

    // 先頭20バイトをバッファに書き込む (オプションは呼び出し側が続けて書く)
    pub fn write_to(&self, buffer: &mut [u8]) {
        buffer[0] = (self.version << 4) | self.ihl;
        buffer[1] = self.tos;
        buffer[2..4].copy_from_slice(&self.total_length.to_be_bytes());
        buffer[4..6].copy_from_slice(&self.identification.to_be_bytes());
        let flags_offset = ((self.flags as u16) << 13) | (self.fragment_offset & 0x1fff);
        buffer[6..8].copy_from_slice(&flags_offset.to_be_bytes());
        buffer[8] = self.ttl;
        buffer[9] = self.protocol;
        buffer[10..12].copy_from_slice(&self.checksum.to_be_bytes());
        buffer[12..16].copy_from_slice(&self.source.octets());
        buffer[16..20].copy_from_slice(&self.destination.octets());
    }
}

// ヘッダーのチェックサムフィールドを再計算して書き戻す
// ヘッダーを書き換えた後は必ずこれを呼ぶ (インクリメンタル更新は行わない)
pub fn store_checksum(frame: &mut [u8], header_len: usize) {
    frame[10] = 0;
    frame[11] = 0;
    let sum = checksum::internet_checksum(&frame[..header_len]);
    frame[10..12].copy_from_slice(&sum.to_be_bytes());
}

// 受信フレームの検証とソースルートオプションの抽出
// 成功時はパース済みヘッダーとソースルート情報を返し、フレームは
// total_lengthちょうどに切り詰めて使用すること
pub fn validate_frame(frame: &[u8]) -> Result<(Ipv4Header, SourceRoute), HeaderError> {
    let header = Ipv4Header::parse(frame).ok_or(HeaderError::TooShort)?;

    if header.version != 4 {
        return Err(HeaderError::BadVersion(header.version));
    }
    if header.ihl < 5 {
        return Err(HeaderError::BadHeaderLength(header.ihl));
    }
    if frame.len() < header.header_len() {
        return Err(HeaderError::TooShort);
    }
    if !checksum::verify(&frame[..header.header_len()]) {
        return Err(HeaderError::BadChecksum);
    }
    if (header.total_length as usize) > frame.len() {
        return Err(HeaderError::LengthMismatch {
            total_length: header.total_length,
            actual: frame.len(),
        });
    }
    if header.header_len() > header.total_length as usize {
        return Err(HeaderError::LengthMismatch {
            total_length: header.total_length,
            actual: header.header_len(),
        });
    }

    let source_route = parse_options(&frame[MIN_HEADER_LEN..header.header_len()])?;

    Ok((header, source_route))
}

// オプション領域の最小限の解析
// フラグメント化とソースルーティングの判定に必要な情報のみを取り出す
fn parse_options(options: &[u8]) -> Result<SourceRoute, HeaderError> {
    let mut route = SourceRoute::default();
    let mut i = 0;

    while i < options.len() {
        let code = options[i];
        match code {
            OPT_END => break,
            OPT_NOP => {
                i += 1;
            }
            _ => {
                // 残り長が不足しているオプションは不正
                if i + 1 >= options.len() {
                    return Err(HeaderError::BadOption {
                        pointer: (MIN_HEADER_LEN + i) as u8,
                    });
                }
                let len = options[i + 1] as usize;
                if len < 2 || i + len > options.len() {
                    return Err(HeaderError::BadOption {
                        pointer: (MIN_HEADER_LEN + i) as u8,
                    });
                }

                if code == OPT_LSRR || code == OPT_SSRR {
                    route.strict = code == OPT_SSRR;
                    // ポインタ位置に残っている次のアドレスを転送先として採用する
                    if len >= 3 {
                        let ptr = options[i + 2] as usize;
                        if ptr >= 4 && ptr - 1 + 4 <= len {
                            let base = i + ptr - 1;
                            route.alt_target = Some(Ipv4Addr::new(
                                options[base],
                                options[base + 1],
                                options[base + 2],
                                options[base + 3],
                            ));
                        }
                    } else {
                        return Err(HeaderError::BadOption {
                            pointer: (MIN_HEADER_LEN + i) as u8,
                        });
                    }
                }

                i += len;
            }
        }
    }

    Ok(route)
}

#[cfg(test)]
mod tests {
    use super::*;

    // テスト用の正しいヘッダーを構築する
    pub(crate) fn build_header(header: &mut Ipv4Header) -> Vec<u8> {
        let mut buffer = vec![0u8; header.header_len()];
        header.checksum = 0;
        header.write_to(&mut buffer);
        store_checksum(&mut buffer, header.header_len());
        header.checksum = u16::from_be_bytes([buffer[10], buffer[11]]);
        buffer
    }

    fn sample() -> Ipv4Header {
        Ipv4Header {
            version: 4,
            ihl: 5,
            tos: 0,
            total_length: 20,
            identification: 0x1234,
            flags: 0,
            fragment_offset: 0,
            ttl: 64,
            protocol: 17,
            checksum: 0,
            source: Ipv4Addr::new(10, 0, 0, 1),
            destination: Ipv4Addr::new(10, 0, 0, 2),
        }
    }

    #[test]
    fn test_parse_round_trip() {
        let mut header = sample();
        let buffer = build_header(&mut header);
        let parsed = Ipv4Header::parse(&buffer).unwrap();

        assert_eq!(parsed.version, 4);
        assert_eq!(parsed.ihl, 5);
        assert_eq!(parsed.identification, 0x1234);
        assert_eq!(parsed.ttl, 64);
        assert_eq!(parsed.protocol, 17);
        assert_eq!(parsed.source, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(parsed.destination, Ipv4Addr::new(10, 0, 0, 2));
    }

    #[test]
    fn test_validate_accepts_correct_header() {
        let mut header = sample();
        let buffer = build_header(&mut header);
        assert!(validate_frame(&buffer).is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_version() {
        let mut header = sample();
        header.version = 6;
        let buffer = build_header(&mut header);
        assert_eq!(validate_frame(&buffer), Err(HeaderError::BadVersion(6)));
    }

    #[test]
    fn test_validate_rejects_bad_checksum() {
        let mut header = sample();
        let mut buffer = build_header(&mut header);
        buffer[8] = buffer[8].wrapping_add(1);
        assert_eq!(validate_frame(&buffer), Err(HeaderError::BadChecksum));
    }

    #[test]
    fn test_validate_rejects_short_ihl() {
        let mut header = sample();
        header.ihl = 4;
        let mut buffer = vec![0u8; 20];
        header.write_to(&mut buffer);
        store_checksum(&mut buffer, 20);
        assert_eq!(validate_frame(&buffer), Err(HeaderError::BadHeaderLength(4)));
    }

    #[test]
    fn test_validate_rejects_total_length_over_buffer() {
        let mut header = sample();
        header.total_length = 100;
        let buffer = build_header(&mut header);
        assert!(matches!(
            validate_frame(&buffer),
            Err(HeaderError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn test_link_padding_is_tolerated() {
        // リンク層のパディングはtotal_lengthを超えた部分として許容される
        let mut header = sample();
        let mut buffer = build_header(&mut header);
        buffer.extend_from_slice(&[0u8; 26]);
        let (parsed, _) = validate_frame(&buffer).unwrap();
        assert_eq!(parsed.total_length, 20);
    }

    #[test]
    fn test_strict_source_route_option() {
        let mut header = sample();
        header.ihl = 7;
        header.total_length = 28;
        let mut buffer = vec![0u8; 28];
        header.write_to(&mut buffer);
        // SSRR: code, len=7, ptr=4, アドレス1個 (+ NOP詰め)
        buffer[20] = 0x89;
        buffer[21] = 7;
        buffer[22] = 4;
        buffer[23..27].copy_from_slice(&[192, 168, 1, 1]);
        buffer[27] = 0;
        store_checksum(&mut buffer, 28);

        let (_, route) = validate_frame(&buffer).unwrap();
        assert!(route.strict);
        assert_eq!(route.alt_target, Some(Ipv4Addr::new(192, 168, 1, 1)));
    }

    #[test]
    fn test_malformed_option_length() {
        let mut header = sample();
        header.ihl = 6;
        header.total_length = 24;
        let mut buffer = vec![0u8; 24];
        header.write_to(&mut buffer);
        // 長さバイトがオプション領域を超える
        buffer[20] = 0x89;
        buffer[21] = 40;
        store_checksum(&mut buffer, 24);

        assert!(matches!(
            validate_frame(&buffer),
            Err(HeaderError::BadOption { .. })
        ));
    }
}
