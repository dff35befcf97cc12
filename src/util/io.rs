use std::path::Path;

use tokio::fs::{self, File};
use tokio::io::{self, AsyncWriteExt, BufWriter};

/// Writes `chunks` to `output_file` back to back, creating missing parent
/// directories.
pub async fn write_chunks<P, I, C>(output_file: P, chunks: I) -> io::Result<u64>
where
    P: AsRef<Path>,
    I: IntoIterator<Item = C>,
    C: AsRef<[u8]>,
{
    let output_file = output_file.as_ref();
    if let Some(parent) = output_file.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await?;
    }

    let mut writer = BufWriter::new(File::create(output_file).await?);
    let mut written = 0u64;
    for chunk in chunks {
        let chunk = chunk.as_ref();
        writer.write_all(chunk).await?;
        written += chunk.len() as u64;
    }
    writer.flush().await?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn concatenates_in_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("out.bin");
        let written = write_chunks(&path, [b"abc".as_slice(), b"", b"de"]).await.unwrap();
        assert_eq!(written, 5);
        assert_eq!(std::fs::read(&path).unwrap(), b"abcde");
    }
}
