use std::str::from_utf8;

/// 快速解析结果，尽可能零拷贝
pub struct QuickQuery<'a> {
    pub tx_id: u16,
    pub qname: &'a str,
    pub qtype: u16,
    /// 第一个 Query 的 QTYPE 字段在报文中的字节偏移，用于原地改写
    pub qtype_offset: usize,
}

/// 仅解析 DNS 头部和第一个 Query，用于请求路由和日志
/// 避免 hickory-proto Message::from_bytes 的全量解析和分配开销
/// buf: 用于存储归一化（小写）域名的缓冲区，建议至少 256 字节
pub fn parse_quick<'a>(packet: &[u8], buf: &'a mut [u8]) -> Option<QuickQuery<'a>> {
    if packet.len() < 12 {
        return None;
    }

    // 1. Transaction ID
    let tx_id = u16::from_be_bytes([packet[0], packet[1]]);

    // 2. QDCOUNT at offset 4
    let qd_count = u16::from_be_bytes([packet[4], packet[5]]);
    if qd_count == 0 {
        return None;
    }

    // 3. Parse QName (start at offset 12)
    let mut pos = 12;
    let mut buf_pos = 0;

    let mut jumped = false;
    let mut max_jumps = 5;
    let mut current_pos = pos;
    let packet_len = packet.len();

    loop {
        if current_pos >= packet_len {
            return None;
        }
        let len = packet[current_pos];

        if len == 0 {
            // End of name
            if !jumped {
                pos = current_pos + 1;
            }
            break;
        }

        if (len & 0xC0) == 0xC0 {
            // Compression pointer
            if packet_len < current_pos + 2 {
                return None;
            }
            if !jumped {
                pos = current_pos + 2;
                jumped = true;
            }
            let offset = (((len as u16) & 0x3F) << 8) | (packet[current_pos + 1] as u16);
            current_pos = offset as usize;
            max_jumps -= 1;
            if max_jumps == 0 {
                return None; // Loop detection
            }
            continue;
        }

        // Label
        let label_len = len as usize;
        current_pos += 1;
        if packet_len < current_pos + label_len {
            return None;
        }

        if buf_pos > 0 {
            if buf_pos >= buf.len() {
                return None;
            }
            buf[buf_pos] = b'.';
            buf_pos += 1;
        }

        let label_bytes = &packet[current_pos..current_pos + label_len];

        // DNS labels are typically ASCII (or Punycode); to_ascii_lowercase
        // on bytes leaves non-ASCII bytes unchanged.
        for &b in label_bytes {
            if buf_pos >= buf.len() {
                return None;
            }
            buf[buf_pos] = b.to_ascii_lowercase();
            buf_pos += 1;
        }

        current_pos += label_len;
    }

    // 4. QType / QClass
    if packet.len() < pos + 4 {
        return None;
    }
    let qtype = u16::from_be_bytes([packet[pos], packet[pos + 1]]);

    let qname = from_utf8(&buf[..buf_pos]).ok()?;

    Some(QuickQuery {
        tx_id,
        qname,
        qtype,
        qtype_offset: pos,
    })
}

/// 原地改写第一个 Query 的 QTYPE，offset 来自 parse_quick
pub fn rewrite_qtype(packet: &mut [u8], qtype_offset: usize, qtype: u16) {
    let bytes = qtype.to_be_bytes();
    packet[qtype_offset] = bytes[0];
    packet[qtype_offset + 1] = bytes[1];
}
