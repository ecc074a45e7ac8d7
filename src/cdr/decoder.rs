//! Fixed-width Avaya CDR line decoder.
//!
//! Column layout (0-based, half-open):
//!
//! ```text
//! [0,11)    end of call       DDMMYY HHMM
//! [12,17)   duration          seconds, required
//! [18,19)   condition code
//! [20,24)   code dial
//! [25,29)   code used
//! [30,53)   dialed number
//! [54,69)   calling number
//! [70,85)   account code
//! [86,91)   ppm               blank -> 0
//! [92,95)   in-trunk seizures blank -> 0
//! [96,99)   out-trunk seizures blank -> 0
//! [100,104) in trunk
//! [105,112) vdn
//! [113,114) feature flag
//! ```

use std::ops::Range;
use std::str::FromStr;

use chrono::{
    DateTime, FixedOffset, Local, LocalResult, NaiveDateTime, Offset, TimeDelta, TimeZone,
};
use thiserror::Error;

use super::types::Cdr;

/// Exact length of a CDR line.
pub const LINE_LENGTH: usize = 114;

/// `chrono` format of the end-of-call column.
pub const END_TIME_FORMAT: &str = "%d%m%y %H%M";

pub(crate) const END_TIME: Range<usize> = 0..11;
pub(crate) const DURATION: Range<usize> = 12..17;
pub(crate) const COND_CODE: Range<usize> = 18..19;
pub(crate) const CODE_DIAL: Range<usize> = 20..24;
pub(crate) const CODE_USED: Range<usize> = 25..29;
pub(crate) const DIALED_NUM: Range<usize> = 30..53;
pub(crate) const CALLING_NUM: Range<usize> = 54..69;
pub(crate) const ACCT_CODE: Range<usize> = 70..85;
pub(crate) const PPM: Range<usize> = 86..91;
pub(crate) const IN_TRK_S: Range<usize> = 92..95;
pub(crate) const OUT_TRK_S: Range<usize> = 96..99;
pub(crate) const IN_TRK: Range<usize> = 100..104;
pub(crate) const VDN: Range<usize> = 105..112;
pub(crate) const FEAT_FLAG: Range<usize> = 113..114;

/// Reasons a line is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("incorrect line length({0})")]
    IncorrectLength(usize),

    #[error("line contains non-ASCII characters")]
    NonAscii,

    #[error("invalid duration {0:?}")]
    Duration(String),

    #[error("invalid end-of-call time {0:?}")]
    EndTime(String),
}

/// Time zone the PBX clock runs in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CallZone {
    /// Process-local zone
    #[default]
    Local,
    /// Fixed UTC offset
    Fixed(FixedOffset),
}

impl CallZone {
    /// Interpret a PBX wall-clock reading as an instant.
    fn resolve(&self, naive: NaiveDateTime) -> DateTime<FixedOffset> {
        match self {
            CallZone::Local => resolve_in(&Local, naive),
            CallZone::Fixed(offset) => resolve_in(offset, naive),
        }
    }

    /// Re-express an instant with the offset in force at that instant.
    fn normalize(&self, instant: DateTime<FixedOffset>) -> DateTime<FixedOffset> {
        match self {
            CallZone::Local => instant.with_timezone(&Local).fixed_offset(),
            CallZone::Fixed(offset) => instant.with_timezone(offset),
        }
    }
}

impl FromStr for CallZone {
    type Err = chrono::ParseError;

    /// `local` or a fixed offset such as `+03:00`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("local") {
            return Ok(CallZone::Local);
        }
        s.parse::<FixedOffset>().map(CallZone::Fixed)
    }
}

fn resolve_in<Tz: TimeZone>(tz: &Tz, naive: NaiveDateTime) -> DateTime<FixedOffset> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => dt.fixed_offset(),
        LocalResult::Ambiguous(earliest, _) => earliest.fixed_offset(),
        // Wall clock inside a DST gap: use the offset in force a day earlier.
        LocalResult::None => {
            let offset = tz
                .offset_from_utc_datetime(&(naive - TimeDelta::days(1)))
                .fix();
            DateTime::from_naive_utc_and_offset(naive - offset, offset)
        }
    }
}

/// Decodes fixed-width CDR lines into [`Cdr`] records.
#[derive(Debug, Clone, Copy, Default)]
pub struct LineDecoder {
    zone: CallZone,
}

impl LineDecoder {
    /// Create a decoder for PBX clocks running in `zone`.
    pub fn new(zone: CallZone) -> Self {
        Self { zone }
    }

    /// Decode one line received from `source`.
    ///
    /// Duration and end time are required. Counters that do not parse are
    /// padding and decode as 0.
    pub fn decode(&self, source: &str, line: &str) -> Result<Cdr, DecodeError> {
        if line.len() != LINE_LENGTH {
            return Err(DecodeError::IncorrectLength(line.len()));
        }
        if !line.is_ascii() {
            return Err(DecodeError::NonAscii);
        }

        let duration = line[DURATION]
            .parse::<u32>()
            .map_err(|_| DecodeError::Duration(line[DURATION].to_string()))?;

        let end = NaiveDateTime::parse_from_str(&line[END_TIME], END_TIME_FORMAT)
            .map_err(|_| DecodeError::EndTime(line[END_TIME].to_string()))?;
        let end = self.zone.resolve(end);
        let timestamp = self
            .zone
            .normalize(end - TimeDelta::seconds(i64::from(duration)));

        Ok(Cdr {
            source: source.to_string(),
            timestamp,
            duration,
            cond_code: flag(line, COND_CODE),
            code_dial: text(line, CODE_DIAL),
            code_used: text(line, CODE_USED),
            dialed_num: text(line, DIALED_NUM),
            calling_num: text(line, CALLING_NUM),
            acct_code: text(line, ACCT_CODE),
            ppm: counter(line, PPM),
            in_trk_s: counter(line, IN_TRK_S),
            out_trk_s: counter(line, OUT_TRK_S),
            in_trk: text(line, IN_TRK),
            vdn: text(line, VDN),
            feat_flag: flag(line, FEAT_FLAG),
        })
    }
}

/// Decode a line using the process-local zone.
pub fn decode_line(source: &str, line: &str) -> Result<Cdr, DecodeError> {
    LineDecoder::default().decode(source, line)
}

fn text(line: &str, range: Range<usize>) -> String {
    line[range].trim_matches(' ').to_string()
}

fn counter(line: &str, range: Range<usize>) -> u32 {
    line[range].trim_matches(' ').parse().unwrap_or(0)
}

fn flag(line: &str, range: Range<usize>) -> char {
    line[range].chars().next().unwrap_or(' ')
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Line from the reference scenario: ended 01.01.24 09:30, lasted 60s.
    pub(crate) fn sample_line() -> String {
        let mut line = String::new();
        line.push_str("010124 0930"); // 0..11
        line.push(' ');
        line.push_str("00060"); // 12..17
        line.push(' ');
        line.push('A'); // 18
        line.push(' ');
        line.push_str("1234"); // 20..24
        line.push(' ');
        line.push_str("5678"); // 25..29
        line.push(' ');
        line.push_str(&format!("{:<23}", "79161234567")); // 30..53
        line.push(' ');
        line.push_str(&format!("{:<15}", "1001")); // 54..69
        line.push(' ');
        line.push_str(&" ".repeat(15)); // 70..85
        line.push(' ');
        line.push_str("00000"); // 86..91
        line.push(' ');
        line.push_str("001"); // 92..95
        line.push(' ');
        line.push_str("002"); // 96..99
        line.push(' ');
        line.push_str("T100"); // 100..104
        line.push(' ');
        line.push_str(&format!("{:<7}", "V0001")); // 105..112
        line.push(' ');
        line.push('N'); // 113
        assert_eq!(line.len(), LINE_LENGTH);
        line
    }

    fn utc_plus_3() -> LineDecoder {
        LineDecoder::new(CallZone::Fixed(FixedOffset::east_opt(3 * 3600).unwrap()))
    }

    #[test]
    fn test_decode_reference_line() {
        let cdr = utc_plus_3().decode("10.0.0.5", &sample_line()).unwrap();

        assert_eq!(cdr.source, "10.0.0.5");
        assert_eq!(
            cdr.timestamp.format("%Y-%m-%d %H:%M:%S %:z").to_string(),
            "2024-01-01 09:29:00 +03:00"
        );
        assert_eq!(cdr.duration, 60);
        assert_eq!(cdr.cond_code, 'A');
        assert_eq!(cdr.code_dial, "1234");
        assert_eq!(cdr.code_used, "5678");
        assert_eq!(cdr.dialed_num, "79161234567");
        assert_eq!(cdr.calling_num, "1001");
        assert_eq!(cdr.acct_code, "");
        assert_eq!(cdr.ppm, 0);
        assert_eq!(cdr.in_trk_s, 1);
        assert_eq!(cdr.out_trk_s, 2);
        assert_eq!(cdr.in_trk, "T100");
        assert_eq!(cdr.vdn, "V0001");
        assert_eq!(cdr.feat_flag, 'N');
    }

    #[test]
    fn test_decode_local_zone_wall_clock() {
        let cdr = decode_line("10.0.0.5", &sample_line()).unwrap();
        assert_eq!(
            cdr.timestamp.naive_local().format("%Y-%m-%d %H:%M:%S").to_string(),
            "2024-01-01 09:29:00"
        );
    }

    #[test]
    fn test_timestamp_is_end_minus_duration() {
        let mut line = sample_line();
        line.replace_range(12..17, "03600");
        let cdr = utc_plus_3().decode("10.0.0.5", &line).unwrap();

        assert_eq!(cdr.duration, 3600);
        assert_eq!(cdr.timestamp.format("%d.%m.%Y %H:%M").to_string(), "01.01.2024 08:30");
        assert_eq!(cdr.end_time().format("%H:%M").to_string(), "09:30");
    }

    #[test]
    fn test_rejects_wrong_lengths() {
        let line = sample_line();
        let decoder = utc_plus_3();

        assert_eq!(
            decoder.decode("10.0.0.5", ""),
            Err(DecodeError::IncorrectLength(0))
        );
        assert_eq!(
            decoder.decode("10.0.0.5", &line[..113]),
            Err(DecodeError::IncorrectLength(113))
        );
        assert_eq!(
            decoder.decode("10.0.0.5", &format!("{line} ")),
            Err(DecodeError::IncorrectLength(115))
        );
    }

    #[test]
    fn test_rejects_multibyte_characters() {
        // 113 chars but 114 bytes: would shift every following column.
        let mut line = sample_line();
        line.replace_range(30..32, "й");
        assert_eq!(line.len(), LINE_LENGTH);

        let err = utc_plus_3().decode("10.0.0.5", &line).unwrap_err();
        assert_eq!(err, DecodeError::NonAscii);
    }

    #[test]
    fn test_rejects_bad_duration() {
        let mut line = sample_line();
        line.replace_range(12..17, "  6 0");
        let err = utc_plus_3().decode("10.0.0.5", &line).unwrap_err();
        assert_eq!(err, DecodeError::Duration("  6 0".to_string()));
    }

    #[test]
    fn test_rejects_negative_duration() {
        let mut line = sample_line();
        line.replace_range(12..17, "-0060");
        let err = utc_plus_3().decode("10.0.0.5", &line).unwrap_err();
        assert!(matches!(err, DecodeError::Duration(_)));
    }

    #[test]
    fn test_rejects_bad_end_time() {
        let mut line = sample_line();
        line.replace_range(0..11, "320124 0930");
        let err = utc_plus_3().decode("10.0.0.5", &line).unwrap_err();
        assert_eq!(err, DecodeError::EndTime("320124 0930".to_string()));
        assert_eq!(err.to_string(), "invalid end-of-call time \"320124 0930\"");
    }

    #[test]
    fn test_blank_counters_decode_as_zero() {
        let mut line = sample_line();
        line.replace_range(86..91, "     ");
        line.replace_range(92..95, "   ");
        line.replace_range(96..99, "   ");

        let cdr = utc_plus_3().decode("10.0.0.5", &line).unwrap();
        assert_eq!((cdr.ppm, cdr.in_trk_s, cdr.out_trk_s), (0, 0, 0));
    }

    #[test]
    fn test_garbage_counters_decode_as_zero() {
        let mut line = sample_line();
        line.replace_range(86..91, "ab\0cd");
        let cdr = utc_plus_3().decode("10.0.0.5", &line).unwrap();
        assert_eq!(cdr.ppm, 0);
    }

    #[test]
    fn test_right_justified_fields_are_trimmed() {
        let mut line = sample_line();
        line.replace_range(20..24, "  12");
        line.replace_range(105..112, "  V0001");
        let cdr = utc_plus_3().decode("10.0.0.5", &line).unwrap();
        assert_eq!(cdr.code_dial, "12");
        assert_eq!(cdr.vdn, "V0001");
    }

    #[test]
    fn test_blank_routing_fields_are_empty() {
        let mut line = sample_line();
        line.replace_range(25..29, "    ");
        line.replace_range(100..104, "    ");
        line.replace_range(105..112, "       ");
        let cdr = utc_plus_3().decode("10.0.0.5", &line).unwrap();
        assert!(cdr.code_used.is_empty());
        assert!(cdr.in_trk.is_empty());
        assert!(cdr.vdn.is_empty());
    }

    #[test]
    fn test_encode_then_decode_is_identity() {
        let decoder = utc_plus_3();
        let cdr = decoder.decode("192.168.1.10", &sample_line()).unwrap();
        let again = decoder.decode("192.168.1.10", &cdr.to_line()).unwrap();
        assert_eq!(again, cdr);
    }

    #[test]
    fn test_call_zone_from_str() {
        assert_eq!("local".parse::<CallZone>().unwrap(), CallZone::Local);
        assert_eq!(
            "+03:00".parse::<CallZone>().unwrap(),
            CallZone::Fixed(FixedOffset::east_opt(3 * 3600).unwrap())
        );
        assert!("Europe/Moscow".parse::<CallZone>().is_err());
    }
}
