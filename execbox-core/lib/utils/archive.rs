//! Building the tar archives uploaded into sandboxes.

use bytes::Bytes;
use tar::{Builder, Header};

use crate::ExecboxResult;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Packs `contents` as a single regular file named `file_name` into an in-memory tar archive.
pub fn single_file_archive(file_name: &str, contents: &[u8]) -> ExecboxResult<Bytes> {
    let mut builder = Builder::new(Vec::new());

    let mut header = Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);
    header.set_entry_type(tar::EntryType::Regular);
    builder.append_data(&mut header, file_name, contents)?;

    Ok(Bytes::from(builder.into_inner()?))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::io::Read;

    use super::*;

    #[test]
    fn test_single_file_archive_holds_code_verbatim() {
        let code = "name = input()\nprint('hi ' + name)\n";
        let archive = single_file_archive("main.py", code.as_bytes()).unwrap();

        let mut archive = tar::Archive::new(&archive[..]);
        let mut entries = archive.entries().unwrap();
        let mut entry = entries.next().unwrap().unwrap();
        assert_eq!(entry.path().unwrap().to_str(), Some("main.py"));

        let mut contents = String::new();
        entry.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, code);
        assert!(entries.next().is_none());
    }
}
