// =============================================================================
// FIX 4.4 tag=value codec
// =============================================================================
//
// Wire form: `8=FIX.4.4|9=<len>|35=...|...|10=<cksum>|` where `|` is SOH
// (0x01). BodyLength (9) counts the bytes between its own trailing SOH and
// the `10=` of the trailer; CheckSum (10) is the byte sum modulo 256 over
// everything before the trailer, rendered as three digits.
//
// The decoder is incremental: it consumes at most one message per call and
// reports how many bytes it used, so the session read loop can keep a single
// growable buffer.
// =============================================================================

use anyhow::{bail, Context, Result};
use chrono::Utc;

/// FIX field separator.
pub const SOH: u8 = 0x01;

const BEGIN_STRING: &str = "FIX.4.4";

// ---------------------------------------------------------------------------
// Tag and MsgType constants (only what this engine speaks)
// ---------------------------------------------------------------------------

pub mod tags {
    pub const BEGIN_SEQ_NO: u32 = 7;
    pub const CHECK_SUM: u32 = 10;
    pub const CL_ORD_ID: u32 = 11;
    pub const CUM_QTY: u32 = 14;
    pub const END_SEQ_NO: u32 = 16;
    pub const EXEC_ID: u32 = 17;
    pub const LAST_PX: u32 = 31;
    pub const LAST_QTY: u32 = 32;
    pub const MSG_SEQ_NUM: u32 = 34;
    pub const MSG_TYPE: u32 = 35;
    pub const NEW_SEQ_NO: u32 = 36;
    pub const ORDER_ID: u32 = 37;
    pub const ORDER_QTY: u32 = 38;
    pub const ORD_STATUS: u32 = 39;
    pub const ORD_TYPE: u32 = 40;
    pub const ORIG_CL_ORD_ID: u32 = 41;
    pub const POSS_DUP_FLAG: u32 = 43;
    pub const PRICE: u32 = 44;
    pub const REF_SEQ_NUM: u32 = 45;
    pub const SENDER_COMP_ID: u32 = 49;
    pub const SENDING_TIME: u32 = 52;
    pub const SIDE: u32 = 54;
    pub const SYMBOL: u32 = 55;
    pub const TARGET_COMP_ID: u32 = 56;
    pub const TEXT: u32 = 58;
    pub const TIME_IN_FORCE: u32 = 59;
    pub const TRANSACT_TIME: u32 = 60;
    pub const AVG_PX: u32 = 6;
    pub const ENCRYPT_METHOD: u32 = 98;
    pub const STOP_PX: u32 = 99;
    pub const HEART_BT_INT: u32 = 108;
    pub const TEST_REQ_ID: u32 = 112;
    pub const ORIG_SENDING_TIME: u32 = 122;
    pub const GAP_FILL_FLAG: u32 = 123;
    pub const RESET_SEQ_NUM_FLAG: u32 = 141;
    pub const EXEC_TYPE: u32 = 150;
    pub const LEAVES_QTY: u32 = 151;
    pub const NO_MD_ENTRIES: u32 = 268;
    pub const MD_ENTRY_TYPE: u32 = 269;
    pub const MD_ENTRY_PX: u32 = 270;
    pub const MD_ENTRY_SIZE: u32 = 271;
    pub const MD_UPDATE_ACTION: u32 = 279;
    pub const CXL_REJ_RESPONSE_TO: u32 = 434;
    pub const SESSION_REJECT_REASON: u32 = 373;
    pub const REF_TAG_ID: u32 = 371;
    pub const REF_MSG_TYPE: u32 = 372;
}

pub mod msg_type {
    pub const HEARTBEAT: &str = "0";
    pub const TEST_REQUEST: &str = "1";
    pub const RESEND_REQUEST: &str = "2";
    pub const REJECT: &str = "3";
    pub const SEQUENCE_RESET: &str = "4";
    pub const LOGOUT: &str = "5";
    pub const EXECUTION_REPORT: &str = "8";
    pub const ORDER_CANCEL_REJECT: &str = "9";
    pub const LOGON: &str = "A";
    pub const NEW_ORDER_SINGLE: &str = "D";
    pub const ORDER_CANCEL_REQUEST: &str = "F";
    pub const ORDER_CANCEL_REPLACE_REQUEST: &str = "G";
    pub const ORDER_STATUS_REQUEST: &str = "H";
    pub const MARKET_DATA_SNAPSHOT: &str = "W";
    pub const MARKET_DATA_INCREMENTAL: &str = "X";
}

/// Administrative (session-level) message types are replaced with
/// SequenceReset-GapFill during resend instead of being replayed.
pub fn is_admin(msg_type: &str) -> bool {
    matches!(msg_type, "0" | "1" | "2" | "3" | "4" | "5" | "A")
}

// ---------------------------------------------------------------------------
// Parsed message
// ---------------------------------------------------------------------------

/// A decoded FIX message: the MsgType plus every field between BodyLength and
/// CheckSum, in wire order (repeating groups rely on that order).
#[derive(Debug, Clone, PartialEq)]
pub struct FixMessage {
    pub msg_type: String,
    pub fields: Vec<(u32, String)>,
}

impl FixMessage {
    /// First occurrence of `tag`.
    pub fn get(&self, tag: u32) -> Option<&str> {
        self.fields
            .iter()
            .find(|(t, _)| *t == tag)
            .map(|(_, v)| v.as_str())
    }

    pub fn get_f64(&self, tag: u32) -> Option<f64> {
        self.get(tag).and_then(|v| v.parse().ok())
    }

    pub fn get_u64(&self, tag: u32) -> Option<u64> {
        self.get(tag).and_then(|v| v.parse().ok())
    }

    /// MsgSeqNum (34).
    pub fn seq_num(&self) -> Option<u64> {
        self.get_u64(tags::MSG_SEQ_NUM)
    }

    /// PossDupFlag (43) set to Y.
    pub fn poss_dup(&self) -> bool {
        self.get(tags::POSS_DUP_FLAG) == Some("Y")
    }
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Byte sum modulo 256 — the FIX CheckSum (10).
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// SendingTime (52) in FIX UTC timestamp format with milliseconds.
pub fn sending_time() -> String {
    Utc::now().format("%Y%m%d-%H:%M:%S%.3f").to_string()
}

/// Stateless message encoder bound to one session's CompIDs.
#[derive(Debug, Clone)]
pub struct FixEncoder {
    pub sender_comp_id: String,
    pub target_comp_id: String,
}

impl FixEncoder {
    pub fn new(sender_comp_id: impl Into<String>, target_comp_id: impl Into<String>) -> Self {
        Self {
            sender_comp_id: sender_comp_id.into(),
            target_comp_id: target_comp_id.into(),
        }
    }

    /// Build a complete wire message: standard header, `body_fields`, trailer.
    pub fn encode(&self, msg_type: &str, seq_num: u64, body_fields: &[(u32, String)]) -> Vec<u8> {
        let mut body = Vec::with_capacity(256);
        push_field(&mut body, tags::MSG_TYPE, msg_type);
        push_field(&mut body, tags::SENDER_COMP_ID, &self.sender_comp_id);
        push_field(&mut body, tags::TARGET_COMP_ID, &self.target_comp_id);
        push_field(&mut body, tags::MSG_SEQ_NUM, &seq_num.to_string());
        push_field(&mut body, tags::SENDING_TIME, &sending_time());
        for (tag, value) in body_fields {
            push_field(&mut body, *tag, value);
        }

        let mut out = Vec::with_capacity(body.len() + 32);
        push_field(&mut out, 8, BEGIN_STRING);
        push_field(&mut out, 9, &body.len().to_string());
        out.extend_from_slice(&body);
        let cksum = checksum(&out);
        push_field(&mut out, tags::CHECK_SUM, &format!("{cksum:03}"));
        out
    }
}

fn push_field(buf: &mut Vec<u8>, tag: u32, value: &str) {
    buf.extend_from_slice(tag.to_string().as_bytes());
    buf.push(b'=');
    buf.extend_from_slice(value.as_bytes());
    buf.push(SOH);
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Try to decode one message from the front of `buf`.
///
/// Returns `Ok(None)` when the buffer holds an incomplete frame, and
/// `Ok(Some((message, consumed)))` on success. A malformed frame is an error;
/// the caller decides how to resynchronize (this engine drops the buffer and
/// counts the strike).
pub fn decode(buf: &[u8]) -> Result<Option<(FixMessage, usize)>> {
    if buf.len() < 2 {
        return Ok(None);
    }
    if !buf.starts_with(b"8=") {
        bail!("frame does not start with BeginString");
    }

    let begin_end = match find_soh(buf, 0) {
        Some(i) => i,
        None => return Ok(None),
    };
    let begin_string = &buf[2..begin_end];
    if begin_string != BEGIN_STRING.as_bytes() {
        bail!(
            "unsupported BeginString {:?}",
            String::from_utf8_lossy(begin_string)
        );
    }

    // BodyLength (9) must immediately follow.
    let len_start = begin_end + 1;
    if buf.len() < len_start + 2 {
        return Ok(None);
    }
    if !buf[len_start..].starts_with(b"9=") {
        bail!("BodyLength missing after BeginString");
    }
    let len_end = match find_soh(buf, len_start) {
        Some(i) => i,
        None => return Ok(None),
    };
    let body_len: usize = std::str::from_utf8(&buf[len_start + 2..len_end])
        .context("BodyLength is not valid UTF-8")?
        .parse()
        .context("BodyLength is not a number")?;

    let body_start = len_end + 1;
    let body_end = body_start + body_len;
    // Trailer: "10=" + 3 digits + SOH.
    let frame_end = body_end + 7;
    if buf.len() < frame_end {
        return Ok(None);
    }

    let trailer = &buf[body_end..frame_end];
    if !trailer.starts_with(b"10=") || trailer[6] != SOH {
        bail!("trailer is not a CheckSum field");
    }
    let declared: u8 = std::str::from_utf8(&trailer[3..6])
        .context("CheckSum is not valid UTF-8")?
        .parse()
        .context("CheckSum is not a number")?;
    let actual = checksum(&buf[..body_end]);
    if declared != actual {
        bail!("checksum mismatch: declared {declared}, computed {actual}");
    }

    // Parse the body fields.
    let mut fields = Vec::new();
    let mut msg_type = None;
    for raw in buf[body_start..body_end].split(|b| *b == SOH) {
        if raw.is_empty() {
            continue;
        }
        let eq = raw
            .iter()
            .position(|b| *b == b'=')
            .context("field without '='")?;
        let tag: u32 = std::str::from_utf8(&raw[..eq])
            .context("tag is not valid UTF-8")?
            .parse()
            .context("tag is not a number")?;
        let value = String::from_utf8(raw[eq + 1..].to_vec())
            .context("value is not valid UTF-8")?;
        if tag == tags::MSG_TYPE {
            msg_type = Some(value.clone());
        }
        fields.push((tag, value));
    }

    let msg_type = msg_type.context("message has no MsgType (35)")?;
    Ok(Some((FixMessage { msg_type, fields }, frame_end)))
}

fn find_soh(buf: &[u8], from: usize) -> Option<usize> {
    buf[from..].iter().position(|b| *b == SOH).map(|i| from + i)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn encoder() -> FixEncoder {
        FixEncoder::new("MERIDIAN", "LPX")
    }

    #[test]
    fn encode_decode_roundtrip() {
        let wire = encoder().encode(
            msg_type::NEW_ORDER_SINGLE,
            7,
            &[
                (tags::CL_ORD_ID, "abc123".to_string()),
                (tags::SYMBOL, "EURUSD".to_string()),
                (tags::SIDE, "1".to_string()),
                (tags::ORDER_QTY, "1".to_string()),
                (tags::ORD_TYPE, "1".to_string()),
            ],
        );

        let (msg, consumed) = decode(&wire).unwrap().unwrap();
        assert_eq!(consumed, wire.len());
        assert_eq!(msg.msg_type, "D");
        assert_eq!(msg.seq_num(), Some(7));
        assert_eq!(msg.get(tags::CL_ORD_ID), Some("abc123"));
        assert_eq!(msg.get(tags::SYMBOL), Some("EURUSD"));
        assert_eq!(msg.get(tags::SENDER_COMP_ID), Some("MERIDIAN"));
        assert_eq!(msg.get(tags::TARGET_COMP_ID), Some("LPX"));
        assert!(!msg.poss_dup());
    }

    #[test]
    fn incomplete_frame_returns_none() {
        let wire = encoder().encode(msg_type::HEARTBEAT, 1, &[]);
        for cut in [1, 5, wire.len() / 2, wire.len() - 1] {
            assert!(decode(&wire[..cut]).unwrap().is_none(), "cut at {cut}");
        }
    }

    #[test]
    fn two_messages_in_one_buffer() {
        let mut wire = encoder().encode(msg_type::HEARTBEAT, 1, &[]);
        let second = encoder().encode(
            msg_type::TEST_REQUEST,
            2,
            &[(tags::TEST_REQ_ID, "t1".to_string())],
        );
        wire.extend_from_slice(&second);

        let (first, used) = decode(&wire).unwrap().unwrap();
        assert_eq!(first.msg_type, "0");
        let (next, used2) = decode(&wire[used..]).unwrap().unwrap();
        assert_eq!(next.msg_type, "1");
        assert_eq!(next.get(tags::TEST_REQ_ID), Some("t1"));
        assert_eq!(used + used2, wire.len());
    }

    #[test]
    fn checksum_mismatch_is_error() {
        let mut wire = encoder().encode(msg_type::HEARTBEAT, 1, &[]);
        // Corrupt one body byte without touching the trailer.
        let idx = wire.len() / 2;
        wire[idx] = wire[idx].wrapping_add(1);
        assert!(decode(&wire).is_err());
    }

    #[test]
    fn garbage_prefix_is_error() {
        assert!(decode(b"garbage\x018=FIX.4.4\x01").is_err());
    }

    #[test]
    fn poss_dup_flag_detected() {
        let wire = encoder().encode(
            msg_type::EXECUTION_REPORT,
            9,
            &[
                (tags::POSS_DUP_FLAG, "Y".to_string()),
                (tags::ORDER_ID, "o1".to_string()),
            ],
        );
        let (msg, _) = decode(&wire).unwrap().unwrap();
        assert!(msg.poss_dup());
    }

    #[test]
    fn admin_classification() {
        assert!(is_admin(msg_type::LOGON));
        assert!(is_admin(msg_type::HEARTBEAT));
        assert!(is_admin(msg_type::SEQUENCE_RESET));
        assert!(!is_admin(msg_type::NEW_ORDER_SINGLE));
        assert!(!is_admin(msg_type::EXECUTION_REPORT));
    }

    #[test]
    fn checksum_is_byte_sum_mod_256() {
        assert_eq!(checksum(b"\x01"), 1);
        assert_eq!(checksum(b"\xff\x02"), 1);
    }
}
