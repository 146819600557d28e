// インターネットチェックサム (RFC 1071)
// 16ビットワード単位の1の補数和を計算し、キャリーを折り返して補数を取る

pub fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum = 0u32;

    // 16ビット単位で合計を計算
    for chunk in data.chunks(2) {
        let mut word = (chunk[0] as u32) << 8;
        if chunk.len() > 1 {
            word |= chunk[1] as u32;
        }
        sum = sum.wrapping_add(word);
    }

    // 上位16ビットを下位16ビットに折り返す
    while (sum >> 16) != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    // 1の補数を取る
    !sum as u16
}

// ヘッダー全体(チェックサムフィールドを含む)の合計が0になることを確認する
pub fn verify(data: &[u8]) -> bool {
    internet_checksum(data) == 0
}
