//! Parses `/kernel.conf`: line-oriented `kind path [param...]`, `#` comments
//! (spec §4.4 step 2).

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleEntry {
    pub kind: String,
    pub path: String,
    pub params: Vec<String>,
}

/// Parses the full contents of `/kernel.conf`.
pub fn parse(contents: &str) -> Vec<ModuleEntry> {
    contents
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let kind = fields.next()?.to_string();
            let path = fields.next()?.to_string();
            let params = fields.map(String::from).collect();
            Some(ModuleEntry { kind, path, params })
        })
        .collect()
}

/// Entries of a given kind, in file order.
pub fn of_kind<'a>(entries: &'a [ModuleEntry], kind: &str) -> Vec<&'a ModuleEntry> {
    entries.iter().filter(|e| e.kind == kind).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_skips_comments_and_blank_lines() {
        let conf = "# base kernel modules\n\nbase /lib/modules/virtio_pci.ko\nbase /lib/modules/virtio_blk.ko\n";
        let entries = parse(conf);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind, "base");
        assert_eq!(entries[0].path, "/lib/modules/virtio_pci.ko");
    }

    #[test]
    fn test_parse_captures_params() {
        let entries = parse("s390x_z13 /lib/modules/foo.ko param1=1 param2=2\n");
        assert_eq!(entries[0].params, vec!["param1=1", "param2=2"]);
    }

    #[test]
    fn test_of_kind_filters() {
        let entries = parse("base /a.ko\nvsock /b.ko\nbase /c.ko\n");
        let base = of_kind(&entries, "base");
        assert_eq!(base.len(), 2);
        assert_eq!(base[1].path, "/c.ko");
    }
}
