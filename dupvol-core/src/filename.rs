//! Volume filenames.
//!
//! ```text
//! <prefix>-<time|b<guid>|i<guid>>.<dblock|dlist|dindex>.<compression>[.<encryption>]
//! ```

use std::fmt;
use std::sync::OnceLock;

use chrono::{DateTime, Duration, SubsecRound, Utc};
use regex::Regex;

use crate::util;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VolumeType {
    Blocks,
    Files,
    Index,
}

/// The one place volume types are tied to their filename tags.
const TYPE_TAGS: [(VolumeType, &str); 3] =
    [(VolumeType::Blocks, "dblock"), (VolumeType::Files, "dlist"), (VolumeType::Index, "dindex")];

impl VolumeType {
    pub fn tag(self) -> &'static str {
        TYPE_TAGS.iter().find(|(t, _)| *t == self).map(|(_, s)| *s).unwrap_or_default()
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        TYPE_TAGS.iter().find(|(_, s)| s.eq_ignore_ascii_case(tag)).map(|(t, _)| *t)
    }

    /// Marker in front of the guid, `None` for timestamped volumes.
    fn guid_marker(self) -> Option<char> {
        match self {
            VolumeType::Blocks => Some('b'),
            VolumeType::Index => Some('i'),
            VolumeType::Files => None,
        }
    }
}

impl fmt::Display for VolumeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// What a volume filename says about the volume.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VolumeIdentity {
    pub prefix: String,
    pub file_type: VolumeType,
    /// Set for `Blocks` and `Index`.
    pub guid: Option<String>,
    /// Set for `Files`.
    pub timestamp: Option<DateTime<Utc>>,
    pub compression_module: String,
    pub encryption_module: Option<String>,
}

impl VolumeIdentity {
    pub fn filename(&self) -> String {
        generate(
            self.file_type,
            &self.prefix,
            self.guid.as_deref(),
            self.timestamp,
            &self.compression_module,
            self.encryption_module.as_deref(),
        )
    }
}

/// A fresh random correlation token for block and index volumes.
pub fn new_guid() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Build a volume filename.
///
/// Block and index volumes use `guid` (a new one is generated when `None`);
/// fileset volumes use `timestamp` (now when `None`), truncated to whole seconds.
pub fn generate(
    file_type: VolumeType,
    prefix: &str,
    guid: Option<&str>,
    timestamp: Option<DateTime<Utc>>,
    compression: &str,
    encryption: Option<&str>,
) -> String {
    let id = match file_type.guid_marker() {
        Some(marker) => {
            let guid = guid.map(str::to_string).unwrap_or_else(new_guid);
            format!("{marker}{guid}")
        }
        None => util::serialize_datetime(&timestamp.unwrap_or_else(util::now)),
    };
    let mut name = format!("{prefix}-{id}.{}.{compression}", file_type.tag());
    if let Some(enc) = encryption.filter(|e| !e.is_empty()) {
        name.push('.');
        name.push_str(enc);
    }
    name
}

fn pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        let tags = TYPE_TAGS.iter().map(|(_, s)| *s).collect::<Vec<_>>().join("|");
        let re = format!(
            r"^(?P<prefix>[^-]+)-(?:(?P<marker>[bBiI])(?P<guid>[0-9A-Fa-f]+)|(?P<time>\d{{8}}T\d{{6}}Z))\.(?P<type>{tags})\.(?P<compression>[^.]+)(?:\.(?P<encryption>.+))?$"
        );
        // Built from constants, so a failure here is a bug in this file.
        Regex::new(&re).expect("volume filename pattern")
    })
}

/// Parse a volume filename. Names that are not volumes give `None`.
pub fn parse(name: &str) -> Option<VolumeIdentity> {
    let caps = pattern().captures(name)?;
    let file_type = VolumeType::from_tag(&caps["type"])?;
    let (guid, timestamp) =
        match (file_type.guid_marker(), caps.name("marker"), caps.name("time")) {
            (Some(expected), Some(marker), None) => {
                if !marker.as_str().eq_ignore_ascii_case(&expected.to_string()) {
                    return None;
                }
                (Some(caps["guid"].to_string()), None)
            }
            (None, None, Some(time)) => (None, Some(util::deserialize_datetime(time.as_str())?)),
            _ => return None,
        };
    Some(VolumeIdentity {
        prefix: caps["prefix"].to_string(),
        file_type,
        guid,
        timestamp,
        compression_module: caps["compression"].to_string(),
        encryption_module: caps.name("encryption").map(|m| m.as_str().to_string()),
    })
}

/// First timestamp at or after `start` whose fileset filename is not taken.
///
/// Two filesets cannot share a second, so each collision moves one second forward.
pub fn next_unused_timestamp(
    start: DateTime<Utc>,
    prefix: &str,
    compression: &str,
    encryption: Option<&str>,
    mut exists: impl FnMut(&str) -> bool,
) -> DateTime<Utc> {
    let mut ts = start.trunc_subsecs(0);
    while exists(&generate(VolumeType::Files, prefix, None, Some(ts), compression, encryption)) {
        ts += Duration::seconds(1);
    }
    ts
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn known_names() {
        let t = Utc.with_ymd_and_hms(2023, 7, 1, 12, 0, 5).unwrap();
        assert_eq!(
            generate(VolumeType::Files, "duplicati", None, Some(t), "zip", Some("aes")),
            "duplicati-20230701T120005Z.dlist.zip.aes"
        );
        assert_eq!(
            generate(VolumeType::Blocks, "duplicati", Some("abc123"), None, "zip", None),
            "duplicati-babc123.dblock.zip"
        );
        assert_eq!(
            generate(VolumeType::Index, "x", Some("ff"), None, "zst", None),
            "x-iff.dindex.zst"
        );
    }

    #[test]
    fn foreign_names_are_ignored() {
        for n in [
            "README.txt",
            "duplicati-babc.dblock",
            "duplicati-babc.dlist.zip",
            "duplicati-iabc.dblock.zip",
            "duplicati-20230701T120005Z.dblock.zip",
            "duplicati-bxyz.dblock.zip",
            "prefix-babc.dblockx.zip",
        ] {
            assert!(parse(n).is_none(), "{n}");
        }
    }

    #[test]
    fn probing_skips_taken_seconds() {
        let t = Utc.with_ymd_and_hms(2023, 7, 1, 12, 0, 5).unwrap();
        let taken = [
            generate(VolumeType::Files, "p", None, Some(t), "zip", None),
            generate(VolumeType::Files, "p", None, Some(t + Duration::seconds(1)), "zip", None),
        ];
        let got = next_unused_timestamp(t, "p", "zip", None, |n| taken.iter().any(|x| x == n));
        assert_eq!(got, t + Duration::seconds(2));
    }

    #[test]
    fn fresh_guids_are_distinct_hex() {
        let a = new_guid();
        let b = new_guid();
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        let name = generate(VolumeType::Blocks, "p", Some(&a), None, "zst", None);
        assert_eq!(parse(&name).unwrap().guid.as_deref(), Some(a.as_str()));
    }
}
