use std::path::PathBuf;

use super::FileFragmentStore;

pub(crate) fn sanitize_filename(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

impl FileFragmentStore {
    pub(crate) fn fragments_dir(&self) -> PathBuf { self.root.join("fragments") }

    /// Fragment ids are opaque; sanitize them and suffix a short hash so distinct ids never share a file.
    pub(crate) fn fragment_file(&self, fid: &str) -> PathBuf {
        let hash = fid.bytes().fold(0xcbf2_9ce4_8422_2325u64, |h, b| (h ^ b as u64).wrapping_mul(0x0100_0000_01b3));
        self.fragments_dir().join(format!("{}-{:08x}.jsonl", sanitize_filename(fid), hash as u32))
    }
}
