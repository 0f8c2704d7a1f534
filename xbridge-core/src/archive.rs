//! Directory packing for file transfer.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::Path;

pub trait Archive: Send + Sync {
    /// Pack the contents of `src_dir` into `dest_file`.
    fn pack(&self, src_dir: &Path, dest_file: &Path) -> io::Result<()>;
    /// Unpack `archive` into `dest_dir`, creating it.
    fn unpack(&self, archive: &Path, dest_dir: &Path) -> io::Result<()>;
}

/// Plain (uncompressed) tar.
#[derive(Debug, Default, Clone, Copy)]
pub struct TarArchive;

impl Archive for TarArchive {
    fn pack(&self, src_dir: &Path, dest_file: &Path) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(dest_file)?);
        {
            let mut builder = tar::Builder::new(&mut writer);
            builder.follow_symlinks(false);
            builder.append_dir_all(".", src_dir)?;
            builder.finish()?;
        }
        writer.flush()
    }

    fn unpack(&self, archive: &Path, dest_dir: &Path) -> io::Result<()> {
        std::fs::create_dir_all(dest_dir)?;
        let reader = BufReader::new(File::open(archive)?);
        let mut archive = tar::Archive::new(reader);
        archive.set_overwrite(false);
        // `unpack` refuses entries that would land outside `dest_dir`.
        archive.unpack(dest_dir)
    }
}
