use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Read;

/// Pack named byte entries into a gzip-compressed tarball.
pub fn pack_tar_gz(entries: &[(String, Vec<u8>)]) -> Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (name, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_cksum();
        builder
            .append_data(&mut header, name, data.as_slice())
            .with_context(|| format!("Failed to append '{}' to archive", name))?;
    }
    let encoder = builder.into_inner().context("Failed to finish tar stream")?;
    encoder.finish().context("Failed to finish gzip stream")
}

/// Read every regular file of a gzip-compressed tarball, in archive order.
pub fn unpack_tar_gz(data: &[u8]) -> Result<Vec<(String, Vec<u8>)>> {
    let mut archive = tar::Archive::new(GzDecoder::new(data));
    let mut out = Vec::new();
    for entry in archive.entries().context("Failed to read archive")? {
        let mut entry = entry.context("Corrupted archive entry")?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let name = entry.path()?.to_string_lossy().into_owned();
        let mut bytes = Vec::new();
        entry
            .read_to_end(&mut bytes)
            .with_context(|| format!("Failed to read '{}' from archive", name))?;
        out.push((name, bytes));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_and_unpack() {
        let entries = vec![
            ("users.json".to_string(), b"{\"openapi\":\"3.0.0\"}".to_vec()),
            ("docs/orders.yaml".to_string(), b"openapi: 3.0.0\n".to_vec()),
        ];
        let packed = pack_tar_gz(&entries).unwrap();
        assert_eq!(&packed[..2], &[0x1f, 0x8b]);
        assert_eq!(unpack_tar_gz(&packed).unwrap(), entries);
    }

    #[test]
    fn test_unpack_rejects_garbage() {
        assert!(unpack_tar_gz(b"not an archive").is_err());
    }
}
