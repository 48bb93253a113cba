//! Test-only helpers for building minimal Windows backup-format tar
//! streams (SPEC_FULL.md §10.4), so composer tests don't need a real
//! `tar` binary or real NTFS security descriptors. Entries built here
//! carry no PAX metadata — exercising the composer's fallback path
//! (bare `DIRECTORY` attribute from entry type, empty SD/EA/reparse) is
//! enough for the scenarios in spec.md §8.

use tar::{Builder, EntryType, Header};

pub struct TarStreamBuilder {
    builder: Builder<Vec<u8>>,
}

impl TarStreamBuilder {
    pub fn new() -> TarStreamBuilder {
        TarStreamBuilder { builder: Builder::new(Vec::new()) }
    }

    pub fn add_dir(&mut self, path: &str) -> &mut Self {
        let mut header = Header::new_gnu();
        header.set_path(path).unwrap();
        header.set_entry_type(EntryType::Directory);
        header.set_size(0);
        header.set_mode(0o755);
        header.set_cksum();
        self.builder.append(&header, std::io::empty()).unwrap();
        self
    }

    pub fn add_file(&mut self, path: &str, data: &[u8]) -> &mut Self {
        let mut header = Header::new_gnu();
        header.set_path(path).unwrap();
        header.set_entry_type(EntryType::Regular);
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        self.builder.append(&header, data).unwrap();
        self
    }

    pub fn add_hardlink(&mut self, path: &str, target: &str) -> &mut Self {
        let mut header = Header::new_gnu();
        header.set_path(path).unwrap();
        header.set_entry_type(EntryType::Link);
        header.set_link_name(target).unwrap();
        header.set_size(0);
        header.set_cksum();
        self.builder.append(&header, std::io::empty()).unwrap();
        self
    }

    pub fn add_whiteout(&mut self, path_without_prefix: &str) -> &mut Self {
        let (dir, base) = match path_without_prefix.rsplit_once('/') {
            Some((d, b)) => (format!("{d}/"), b),
            None => (String::new(), path_without_prefix),
        };
        self.add_file(&format!("{dir}.wh.{base}"), &[])
    }

    pub fn finish(self) -> Vec<u8> {
        let mut builder = self.builder;
        builder.finish().unwrap();
        builder.into_inner().unwrap()
    }
}

impl Default for TarStreamBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_nonempty_stream() {
        let bytes = TarStreamBuilder::new().add_dir("a").add_file("a/b.txt", b"hi").finish();
        assert!(!bytes.is_empty());
    }
}
