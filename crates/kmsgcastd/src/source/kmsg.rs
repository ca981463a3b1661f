//! `/dev/kmsg` record parsing.
//!
//! Each record read from `/dev/kmsg` has the form
//! `<prefix>,<seq>,<timestamp_us>,<flags>[,...];<message>\n`, optionally
//! followed by dictionary lines that begin with a space (` KEY=value`).
//! Subscribers see console-style text instead:
//! `[    5.123456] <message>\n`.

/// One parsed `/dev/kmsg` record, borrowing its message from the input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KmsgRecord<'a> {
    /// Syslog priority (low 3 bits of the prefix)
    pub level: u8,
    /// Syslog facility (remaining bits of the prefix)
    pub facility: u32,
    /// Monotonic record sequence number
    pub sequence: u64,
    /// Microseconds since boot
    pub timestamp_us: u64,
    /// Message text without the trailing newline
    pub message: &'a [u8],
}

impl<'a> KmsgRecord<'a> {
    /// Parses a record header line. Returns `None` for dictionary lines
    /// and for anything that does not look like a record.
    pub fn parse(line: &'a [u8]) -> Option<Self> {
        if line.first() == Some(&b' ') {
            return None;
        }

        let split = line.iter().position(|b| *b == b';')?;
        let (header, rest) = line.split_at(split);
        let message = rest.get(1..)?;
        let message = message.strip_suffix(b"\n").unwrap_or(message);

        let header = std::str::from_utf8(header).ok()?;
        let mut fields = header.split(',');
        let prefix: u32 = fields.next()?.trim().parse().ok()?;
        let sequence: u64 = fields.next()?.trim().parse().ok()?;
        let timestamp_us: u64 = fields.next()?.trim().parse().ok()?;

        Some(Self {
            level: (prefix & 0x7) as u8,
            facility: prefix >> 3,
            sequence,
            timestamp_us,
            message,
        })
    }

    /// Renders the record the way the kernel console prints it.
    pub fn to_console_line(&self) -> Vec<u8> {
        let secs = self.timestamp_us / 1_000_000;
        let micros = self.timestamp_us % 1_000_000;
        let mut out = format!("[{secs:5}.{micros:06}] ").into_bytes();
        out.extend_from_slice(self.message);
        out.push(b'\n');
        out
    }
}

/// Converts one raw `/dev/kmsg` line into console form.
///
/// Dictionary lines are dropped (`None`). Lines that do not parse as a
/// record are passed through unchanged.
pub fn format_kmsg_record(line: &[u8]) -> Option<Vec<u8>> {
    if line.first() == Some(&b' ') {
        return None;
    }
    match KmsgRecord::parse(line) {
        Some(record) => Some(record.to_console_line()),
        None => Some(line.to_vec()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_record() {
        let record = KmsgRecord::parse(b"6,339,5140900,-;NET: Registered protocol family 10\n")
            .expect("record should parse");
        assert_eq!(record.level, 6);
        assert_eq!(record.facility, 0);
        assert_eq!(record.sequence, 339);
        assert_eq!(record.timestamp_us, 5_140_900);
        assert_eq!(record.message, b"NET: Registered protocol family 10");
    }

    #[test]
    fn test_parse_facility_and_extra_header_fields() {
        let record = KmsgRecord::parse(b"30,12,1000,c,caller=T1;systemd[1]: started\n").unwrap();
        assert_eq!(record.level, 6);
        assert_eq!(record.facility, 3);
        assert_eq!(record.message, b"systemd[1]: started");
    }

    #[test]
    fn test_console_line_format() {
        let record = KmsgRecord::parse(b"6,1,5140900,-;hello\n").unwrap();
        assert_eq!(record.to_console_line(), b"[    5.140900] hello\n".to_vec());
    }

    #[test]
    fn test_dictionary_lines_are_dropped() {
        assert_eq!(format_kmsg_record(b" SUBSYSTEM=net\n"), None);
    }

    #[test]
    fn test_unparseable_line_passes_through() {
        assert_eq!(
            format_kmsg_record(b"plain text\n"),
            Some(b"plain text\n".to_vec())
        );
        assert_eq!(
            format_kmsg_record(b"x,y,z;not numbers\n"),
            Some(b"x,y,z;not numbers\n".to_vec())
        );
    }
}
