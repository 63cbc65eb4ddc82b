//! Deterministic archive encode/decode. All file mtimes are normalized to a
//! constant, ownership to uid=gid=0, entries sorted lexicographically —
//! byte-identical inputs produce byte-identical outputs.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use flate2::write::GzEncoder;
use flate2::Compression;
use kiln_core::Error;
use tar::Builder;
use walkdir::WalkDir;

/// The fixed mtime every archived file is normalized to before encoding.
const FIXED_MTIME: u64 = 0;

fn sorted_entries(root: &Path) -> kiln_core::Result<Vec<walkdir::DirEntry>> {
    let mut entries: Vec<_> = WalkDir::new(root)
        .into_iter()
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| Error::io(std::io::Error::other(e), "walking payload tree", Some(root.to_path_buf())))?;
    entries.sort_by(|a, b| a.path().cmp(b.path()));
    Ok(entries)
}

fn append_entries(
    builder: &mut Builder<impl std::io::Write>,
    root: &Path,
    entries: &[walkdir::DirEntry],
) -> kiln_core::Result<()> {
    for entry in entries {
        if entry.path() == root {
            continue;
        }
        let rel = entry.path().strip_prefix(root).unwrap();
        let mut header = tar::Header::new_gnu();
        let metadata = entry.metadata().map_err(|e| {
            Error::io(std::io::Error::other(e), "reading metadata", Some(entry.path().to_path_buf()))
        })?;
        header.set_metadata(&metadata);
        header.set_mtime(FIXED_MTIME);
        header.set_uid(0);
        header.set_gid(0);
        header.set_username("").ok();
        header.set_groupname("").ok();

        if metadata.is_dir() {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_size(0);
            header.set_cksum();
            builder
                .append_data(&mut header, rel, std::io::empty())
                .map_err(|e| Error::io(e, "appending directory entry", Some(entry.path().to_path_buf())))?;
        } else {
            let file = File::open(entry.path())
                .map_err(|e| Error::io(e, "opening payload file", Some(entry.path().to_path_buf())))?;
            header.set_size(metadata.len());
            header.set_cksum();
            builder
                .append_data(&mut header, rel, file)
                .map_err(|e| Error::io(e, "appending file entry", Some(entry.path().to_path_buf())))?;
        }
    }
    Ok(())
}

/// Writes an uncompressed, deterministic tar archive of `root` to `dest`.
pub fn write_tar(dest: &Path, root: &Path) -> kiln_core::Result<()> {
    let entries = sorted_entries(root)?;
    let file = File::create(dest).map_err(|e| Error::io(e, "creating archive", Some(dest.to_path_buf())))?;
    let mut builder = Builder::new(BufWriter::new(file));
    append_entries(&mut builder, root, &entries)?;
    builder
        .into_inner()
        .map_err(|e| Error::io(e, "finishing archive", Some(dest.to_path_buf())))?;
    Ok(())
}

/// Writes a deterministic gzip-compressed tar archive of `root` to `dest`.
/// No filename or mtime is embedded in the gzip header.
pub fn write_tar_gz(dest: &Path, root: &Path) -> kiln_core::Result<()> {
    let entries = sorted_entries(root)?;
    let file = File::create(dest).map_err(|e| Error::io(e, "creating archive", Some(dest.to_path_buf())))?;
    let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    let mut builder = Builder::new(encoder);
    append_entries(&mut builder, root, &entries)?;
    let encoder = builder
        .into_inner()
        .map_err(|e| Error::io(e, "finishing archive", Some(dest.to_path_buf())))?;
    encoder
        .finish()
        .map_err(|e| Error::io(e, "finishing gzip stream", Some(dest.to_path_buf())))?;
    Ok(())
}

/// Extracts an archive into `dest`, auto-detecting gzip by magic bytes
/// (mirrors the original's reliance on `tar xf`'s own auto-detection).
pub fn extract(archive_path: &Path, dest: &Path) -> kiln_core::Result<()> {
    let mut magic = [0u8; 2];
    {
        use std::io::Read;
        let mut f = File::open(archive_path)
            .map_err(|e| Error::io(e, "opening archive", Some(archive_path.to_path_buf())))?;
        let n = f.read(&mut magic).unwrap_or(0);
        if n < 2 {
            magic = [0, 0];
        }
    }
    std::fs::create_dir_all(dest).map_err(|e| Error::io(e, "creating extraction dir", Some(dest.to_path_buf())))?;

    let file = File::open(archive_path)
        .map_err(|e| Error::io(e, "opening archive", Some(archive_path.to_path_buf())))?;
    if magic == [0x1f, 0x8b] {
        let decoder = flate2::read::GzDecoder::new(file);
        let mut archive = tar::Archive::new(decoder);
        archive
            .unpack(dest)
            .map_err(|e| Error::io(e, "extracting archive", Some(archive_path.to_path_buf())))?;
    } else {
        let mut archive = tar::Archive::new(file);
        archive
            .unpack(dest)
            .map_err(|e| Error::io(e, "extracting archive", Some(archive_path.to_path_buf())))?;
    }
    Ok(())
}

/// Recursively hardlinks every regular file under `source` into the
/// matching relative path under `dest`, creating directories as needed.
/// Used to assemble a system's sandbox from its already-built install tree
/// without copying bytes.
pub fn hardlink_all_files(source: &Path, dest: &Path) -> kiln_core::Result<()> {
    for entry in WalkDir::new(source) {
        let entry = entry.map_err(|e| {
            Error::io(std::io::Error::other(e), "walking install tree", Some(source.to_path_buf()))
        })?;
        let rel = entry.path().strip_prefix(source).unwrap();
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)
                .map_err(|e| Error::io(e, "creating sandbox directory", Some(target.clone())))?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| Error::io(e, "creating sandbox directory", Some(parent.to_path_buf())))?;
            }
            std::fs::hard_link(entry.path(), &target)
                .map_err(|e| Error::io(e, "hardlinking install file", Some(target)))?;
        }
    }
    Ok(())
}

/// Sets mtime on every file and directory under `root` to the fixed
/// deterministic value, recursively.
pub fn set_mtime_recursively(root: &Path) -> kiln_core::Result<()> {
    let time = filetime::FileTime::from_unix_time(FIXED_MTIME as i64, 0);
    for entry in WalkDir::new(root).contents_first(true) {
        let entry = entry.map_err(|e| {
            Error::io(std::io::Error::other(e), "walking tree for mtime reset", Some(root.to_path_buf()))
        })?;
        filetime::set_file_times(entry.path(), time, time)
            .map_err(|e| Error::io(e, "setting mtime", Some(entry.path().to_path_buf())))?;
    }
    Ok(())
}
