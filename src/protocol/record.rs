//! Control-line codec.
//!
//! Wire format (one line each, `\n` terminated):
//!   `C<mode-octal> <size-decimal> <name>`  file header
//!   `D<mode-octal> <ignored> <name>`       directory header
//!   `E`                                    end of directory
//!   `\x01<message>` / `\x02<message>`      error record (warning / fatal)

use bytes::{BufMut, Bytes, BytesMut};

/// Permission bits carried in a header.
pub const MODE_MASK: u32 = 0o7777;

// =============================================================================
// Record types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Fatal,
}

impl Severity {
    pub fn marker(self) -> u8 {
        match self {
            Severity::Warning => 0x01,
            Severity::Fatal => 0x02,
        }
    }

    fn from_marker(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Severity::Warning),
            0x02 => Some(Severity::Fatal),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRecord {
    /// Names are raw bytes; nothing on the wire promises UTF-8.
    File { mode: u32, size: u64, name: Vec<u8> },
    Dir { mode: u32, name: Vec<u8> },
    End,
    /// Human-readable failure sent in place of a header
    Fault { severity: Severity, message: String },
    /// Anything that does not match the grammar; holds the raw line
    Unknown(String),
}

impl ControlRecord {
    pub fn file(mode: u32, size: u64, name: impl Into<Vec<u8>>) -> Self {
        ControlRecord::File {
            mode,
            size,
            name: name.into(),
        }
    }

    pub fn dir(mode: u32, name: impl Into<Vec<u8>>) -> Self {
        ControlRecord::Dir {
            mode,
            name: name.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        ControlRecord::Fault {
            severity: Severity::Warning,
            message: message.into(),
        }
    }

    /// Error records are not acknowledged by the receiving side.
    pub fn is_fault(&self) -> bool {
        matches!(self, ControlRecord::Fault { .. })
    }

    // =========================================================================
    // Parsing
    // =========================================================================

    /// Parse one line (with or without its trailing newline).
    ///
    /// Malformed numeric fields parse as zero; only the overall shape of the
    /// line decides between a header and `Unknown`.
    pub fn parse(line: &[u8]) -> Self {
        let line = line.strip_suffix(b"\n").unwrap_or(line);
        let unknown = || ControlRecord::Unknown(String::from_utf8_lossy(line).into_owned());

        if let Some(severity) = line.first().copied().and_then(Severity::from_marker) {
            return ControlRecord::Fault {
                severity,
                message: String::from_utf8_lossy(&line[1..]).into_owned(),
            };
        }

        if line == b"E" {
            return ControlRecord::End;
        }

        let kind = match line.first() {
            Some(b'C') => b'C',
            Some(b'D') => b'D',
            _ => return unknown(),
        };

        let mut fields = line.splitn(3, |b| *b == b' ');
        let (Some(head), Some(size), Some(name)) = (fields.next(), fields.next(), fields.next())
        else {
            return unknown();
        };

        if !is_valid_name(name) {
            return unknown();
        }

        let mode = parse_mode(&head[1..]);
        let name = name.to_vec();
        match kind {
            b'C' => ControlRecord::File {
                mode,
                size: parse_size(size),
                name,
            },
            _ => ControlRecord::Dir { mode, name },
        }
    }

    // =========================================================================
    // Serialization
    // =========================================================================

    /// Header names must already satisfy [`is_valid_name`].
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            ControlRecord::File { mode, size, name } => {
                buf.put_slice(format!("C{:04o} {} ", mode & MODE_MASK, size).as_bytes());
                buf.put_slice(name);
                buf.put_u8(b'\n');
            }
            ControlRecord::Dir { mode, name } => {
                buf.put_slice(format!("D{:04o} 0 ", mode & MODE_MASK).as_bytes());
                buf.put_slice(name);
                buf.put_u8(b'\n');
            }
            ControlRecord::End => buf.put_slice(b"E\n"),
            ControlRecord::Fault { severity, message } => {
                buf.put_u8(severity.marker());
                buf.put_slice(message.replace('\n', " ").as_bytes());
                buf.put_u8(b'\n');
            }
            ControlRecord::Unknown(raw) => {
                buf.put_slice(raw.as_bytes());
                buf.put_u8(b'\n');
            }
        }
        buf.freeze()
    }
}

fn parse_mode(s: &[u8]) -> u32 {
    std::str::from_utf8(s)
        .ok()
        .and_then(|s| u32::from_str_radix(s, 8).ok())
        .unwrap_or(0)
}

fn parse_size(s: &[u8]) -> u64 {
    std::str::from_utf8(s)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

/// A header name is a single path component that fits on one line.
pub fn is_valid_name(name: &[u8]) -> bool {
    !name.is_empty()
        && name != b"."
        && name != b".."
        && !name.contains(&b'/')
        && !name.contains(&b'\n')
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_file_header() {
        assert_eq!(
            ControlRecord::parse(b"C0644 4 x\n"),
            ControlRecord::file(0o644, 4, "x")
        );
    }

    #[test]
    fn test_parse_name_with_spaces() {
        assert_eq!(
            ControlRecord::parse(b"C0600 12 my report.txt\n"),
            ControlRecord::file(0o600, 12, "my report.txt")
        );
    }

    #[test]
    fn test_parse_dir_ignores_count() {
        assert_eq!(
            ControlRecord::parse(b"D0755 1 a\n"),
            ControlRecord::dir(0o755, "a")
        );
        assert_eq!(
            ControlRecord::parse(b"D0755 0 a\n"),
            ControlRecord::dir(0o755, "a")
        );
    }

    #[test]
    fn test_parse_end() {
        assert_eq!(ControlRecord::parse(b"E\n"), ControlRecord::End);
        assert_eq!(ControlRecord::parse(b"E"), ControlRecord::End);
    }

    #[test]
    fn test_malformed_numbers_become_zero() {
        assert_eq!(
            ControlRecord::parse(b"C0689 12x f\n"),
            ControlRecord::file(0, 0, "f")
        );
        assert_eq!(
            ControlRecord::parse(b"Cxyz -5 f\n"),
            ControlRecord::file(0, 0, "f")
        );
    }

    #[test]
    fn test_unknown_lines() {
        assert!(matches!(
            ControlRecord::parse(b"T1234 0 1234 0\n"),
            ControlRecord::Unknown(_)
        ));
        assert!(matches!(
            ControlRecord::parse(b"C0644 4\n"),
            ControlRecord::Unknown(_)
        ));
        assert!(matches!(ControlRecord::parse(b"\n"), ControlRecord::Unknown(_)));
        assert!(matches!(
            ControlRecord::parse(b"E extra\n"),
            ControlRecord::Unknown(_)
        ));
    }

    #[test]
    fn test_rejects_path_names() {
        for line in [
            &b"C0644 1 ../escape\n"[..],
            b"C0644 1 a/b\n",
            b"D0755 0 ..\n",
            b"D0755 0 .\n",
        ] {
            assert!(
                matches!(ControlRecord::parse(line), ControlRecord::Unknown(_)),
                "accepted {:?}",
                String::from_utf8_lossy(line)
            );
        }
    }

    #[test]
    fn test_name_bytes_kept_verbatim() {
        assert_eq!(
            ControlRecord::parse(b"C0644 2 caf\xe9\n"),
            ControlRecord::file(0o644, 2, &b"caf\xe9"[..])
        );
        assert_eq!(
            &ControlRecord::dir(0o755, &b"caf\xe9"[..]).encode()[..],
            b"D0755 0 caf\xe9\n"
        );
    }

    #[test]
    fn test_valid_names() {
        assert!(is_valid_name(b"report.txt"));
        assert!(is_valid_name(b"with space"));
        assert!(!is_valid_name(b""));
        assert!(!is_valid_name(b"a\nC0644 3 b"));
        assert!(!is_valid_name(b"a/b"));
        assert!(!is_valid_name(b".."));
    }

    #[test]
    fn test_parse_fault() {
        assert_eq!(
            ControlRecord::parse(b"\x01scp: /nope: No such file\n"),
            ControlRecord::warning("scp: /nope: No such file")
        );
        assert_eq!(
            ControlRecord::parse(b"\x02fatal\n"),
            ControlRecord::Fault {
                severity: Severity::Fatal,
                message: "fatal".to_string()
            }
        );
    }

    #[test]
    fn test_encode() {
        assert_eq!(
            &ControlRecord::file(0o100644, 4, "x").encode()[..],
            b"C0644 4 x\n"
        );
        assert_eq!(&ControlRecord::dir(0o40755, "a").encode()[..], b"D0755 0 a\n");
        assert_eq!(&ControlRecord::End.encode()[..], b"E\n");
        assert_eq!(
            &ControlRecord::warning("bad\nthing").encode()[..],
            b"\x01bad thing\n"
        );
    }

    proptest! {
        #[test]
        fn prop_parse_never_panics(line in proptest::collection::vec(any::<u8>(), 0..256)) {
            let _ = ControlRecord::parse(&line);
        }

        #[test]
        fn prop_file_header_fields_survive(
            mode in 0u32..=0o7777,
            size in any::<u64>(),
            name in "[a-zA-Z0-9_. -]{1,40}",
        ) {
            prop_assume!(name != "." && name != "..");
            let encoded = ControlRecord::file(mode, size, name.clone()).encode();
            let parsed = ControlRecord::parse(&encoded);
            prop_assert_eq!(parsed, ControlRecord::file(mode, size, name));
        }
    }
}
