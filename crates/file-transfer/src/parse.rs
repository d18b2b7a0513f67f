//! A small, total parser for the tab-separated listing lines the device's
//! `_rt_list` probe prints. Deliberately not `eval`: a malformed line fails
//! closed with a parse error rather than being executed as code (§9).

use repl_proto::FileEntry;

/// Parse one `name\tfull_path\tis_dir\tsize` line.
pub fn parse_entry_line(line: &str) -> Result<FileEntry, String> {
    let mut fields = line.splitn(4, '\t');
    let name = fields.next().ok_or("missing name field")?.to_string();
    let path = fields.next().ok_or("missing path field")?.to_string();
    let is_dir_raw = fields.next().ok_or("missing is_dir field")?;
    let size_raw = fields.next().ok_or("missing size field")?;

    let is_dir = match is_dir_raw {
        "1" => true,
        "0" => false,
        other => return Err(format!("invalid is_dir flag: {other:?}")),
    };
    let size = size_raw
        .parse::<u64>()
        .map_err(|e| format!("invalid size field {size_raw:?}: {e}"))?;

    Ok(FileEntry {
        name,
        path,
        is_dir,
        size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_well_formed_file_entry() {
        let entry = parse_entry_line("boot.py\t/boot.py\t0\t123").unwrap();
        assert_eq!(entry.name, "boot.py");
        assert_eq!(entry.path, "/boot.py");
        assert!(!entry.is_dir);
        assert_eq!(entry.size, 123);
    }

    #[test]
    fn parses_a_directory_entry() {
        let entry = parse_entry_line("lib\t/lib\t1\t0").unwrap();
        assert!(entry.is_dir);
    }

    #[test]
    fn rejects_malformed_is_dir_flag() {
        assert!(parse_entry_line("a\t/a\tmaybe\t0").is_err());
    }

    #[test]
    fn rejects_missing_fields() {
        assert!(parse_entry_line("a\t/a").is_err());
    }

    #[test]
    fn rejects_non_numeric_size() {
        assert!(parse_entry_line("a\t/a\t0\tbig").is_err());
    }
}
