use std::io::{self, Read};

use chrono::{DateTime, NaiveDateTime, SubsecRound, Utc};

/// Compact, sortable UTC format used in filenames, manifests and fileset entries.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%SZ";

pub fn serialize_datetime(t: &DateTime<Utc>) -> String {
    t.format(TIMESTAMP_FORMAT).to_string()
}

pub fn deserialize_datetime(s: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT).ok().map(|n| n.and_utc())
}

/// Current time at the resolution the timestamp format can represent.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0)
}

/// Read until `buf` is full or the stream ends, retrying short reads.
///
/// Compressed and network streams often return fewer bytes than asked for,
/// so a single `read` cannot be used to detect the end of an entry.
pub fn force_read(r: &mut dyn Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    struct Dribble<'a>(&'a [u8]);

    impl Read for Dribble<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = buf.len().min(self.0.len()).min(3);
            buf[..n].copy_from_slice(&self.0[..n]);
            self.0 = &self.0[n..];
            Ok(n)
        }
    }

    #[test]
    fn force_read_fills_across_short_reads() {
        let data: Vec<u8> = (0..20).collect();
        let mut r = Dribble(&data);
        let mut buf = [0u8; 16];
        assert_eq!(force_read(&mut r, &mut buf).unwrap(), 16);
        assert_eq!(&buf[..], &data[..16]);
        assert_eq!(force_read(&mut r, &mut buf).unwrap(), 4);
        assert_eq!(force_read(&mut r, &mut buf).unwrap(), 0);
    }

    #[test]
    fn timestamp_roundtrip() {
        let t = Utc.with_ymd_and_hms(2024, 2, 29, 23, 5, 9).unwrap();
        let s = serialize_datetime(&t);
        assert_eq!(s, "20240229T230509Z");
        assert_eq!(deserialize_datetime(&s), Some(t));
        assert_eq!(deserialize_datetime("2024-02-29"), None);
    }
}
