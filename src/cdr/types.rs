//! CDR type definitions.

use chrono::{DateTime, FixedOffset, TimeDelta};
use serde::{Deserialize, Serialize};

use super::decoder::{
    ACCT_CODE, CALLING_NUM, CODE_DIAL, CODE_USED, COND_CODE, DIALED_NUM, DURATION, END_TIME,
    END_TIME_FORMAT, FEAT_FLAG, IN_TRK, IN_TRK_S, LINE_LENGTH, OUT_TRK_S, PPM, VDN,
};

/// Call Detail Record emitted by an Avaya PBX.
///
/// Records are immutable once the decoder hands them downstream; workers
/// share them behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cdr {
    /// Host part of the PBX connection's peer address
    pub source: String,

    /// Start of the call (end-of-call time minus duration)
    pub timestamp: DateTime<FixedOffset>,

    /// Call duration in seconds
    pub duration: u32,

    /// Condition code (call disposition)
    pub cond_code: char,

    /// Dialed access code
    pub code_dial: String,

    /// Trunk/route access code actually used
    pub code_used: String,

    /// Destination digits
    pub dialed_num: String,

    /// Calling party digits
    pub calling_num: String,

    /// Account code
    pub acct_code: String,

    /// Pulse-per-minute counter
    pub ppm: u32,

    /// Incoming trunk seizure count
    pub in_trk_s: u32,

    /// Outgoing trunk seizure count
    pub out_trk_s: u32,

    /// Incoming trunk id
    pub in_trk: String,

    /// Vector directory number
    pub vdn: String,

    /// Feature flag
    pub feat_flag: char,
}

impl Cdr {
    /// Create a record with blank text fields and zero counters.
    pub fn new(source: &str, timestamp: DateTime<FixedOffset>, duration: u32) -> Self {
        Self {
            source: source.to_string(),
            timestamp,
            duration,
            cond_code: ' ',
            code_dial: String::new(),
            code_used: String::new(),
            dialed_num: String::new(),
            calling_num: String::new(),
            acct_code: String::new(),
            ppm: 0,
            in_trk_s: 0,
            out_trk_s: 0,
            in_trk: String::new(),
            vdn: String::new(),
            feat_flag: ' ',
        }
    }

    /// Set dialed and calling numbers.
    pub fn with_numbers(mut self, dialed: &str, calling: &str) -> Self {
        self.dialed_num = dialed.to_string();
        self.calling_num = calling.to_string();
        self
    }

    /// Set outbound route (`code_used`) and inbound trunk (`in_trk`).
    pub fn with_trunks(mut self, code_used: &str, in_trk: &str) -> Self {
        self.code_used = code_used.to_string();
        self.in_trk = in_trk.to_string();
        self
    }

    /// Set vector directory number.
    pub fn with_vdn(mut self, vdn: &str) -> Self {
        self.vdn = vdn.to_string();
        self
    }

    /// Set condition code and feature flag.
    pub fn with_flags(mut self, cond_code: char, feat_flag: char) -> Self {
        self.cond_code = cond_code;
        self.feat_flag = feat_flag;
        self
    }

    /// End-of-call instant as reported by the PBX.
    pub fn end_time(&self) -> DateTime<FixedOffset> {
        self.timestamp + TimeDelta::seconds(i64::from(self.duration))
    }

    /// Render the record in the 114-column PBX layout.
    ///
    /// Text fields are left-justified and truncated to their column width,
    /// counters are zero-padded. The PBX reports minutes only, so seconds
    /// of the end time are lost.
    pub fn to_line(&self) -> String {
        let mut line = vec![b' '; LINE_LENGTH];

        put(&mut line, END_TIME, &self.end_time().format(END_TIME_FORMAT).to_string());
        put(&mut line, DURATION, &format!("{:05}", self.duration));
        put(&mut line, COND_CODE, &self.cond_code.to_string());
        put(&mut line, CODE_DIAL, &self.code_dial);
        put(&mut line, CODE_USED, &self.code_used);
        put(&mut line, DIALED_NUM, &self.dialed_num);
        put(&mut line, CALLING_NUM, &self.calling_num);
        put(&mut line, ACCT_CODE, &self.acct_code);
        put(&mut line, PPM, &format!("{:05}", self.ppm));
        put(&mut line, IN_TRK_S, &format!("{:03}", self.in_trk_s));
        put(&mut line, OUT_TRK_S, &format!("{:03}", self.out_trk_s));
        put(&mut line, IN_TRK, &self.in_trk);
        put(&mut line, VDN, &self.vdn);
        put(&mut line, FEAT_FLAG, &self.feat_flag.to_string());

        line.into_iter().map(char::from).collect()
    }
}

/// Copy the ASCII bytes of `value` into `range`, truncating to its width.
fn put(line: &mut [u8], range: std::ops::Range<usize>, value: &str) {
    let width = range.len();
    for (slot, byte) in line[range]
        .iter_mut()
        .zip(value.bytes().filter(u8::is_ascii).take(width))
    {
        *slot = byte;
    }
}
