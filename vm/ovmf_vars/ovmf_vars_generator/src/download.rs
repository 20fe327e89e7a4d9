// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Fetch-if-absent HTTP download of the validation kernel and initrd.

use anyhow::Context;
use ovmf_vars::FetchPayload;
use std::io::Read;
use std::io::Write;
use std::path::Path;

const CHUNK_SIZE: usize = 1024;

/// Downloads payload files over HTTP(S).
#[derive(Debug, Default)]
pub struct HttpFetcher;

impl FetchPayload for HttpFetcher {
    fn fetch(
        &mut self,
        url: &str,
        target: &Path,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        download(url, target)?;
        Ok(())
    }
}

/// Downloads `url` to `target` unless `target` already exists.
///
/// The body is streamed to a sibling `.part` file which is renamed into place
/// once complete, so an interrupted download is never mistaken for a cached
/// one.
pub fn download(url: &str, target: &Path) -> anyhow::Result<()> {
    if target.exists() {
        tracing::debug!(path = %target.display(), "using cached download");
        return Ok(());
    }

    tracing::info!(url, path = %target.display(), "downloading");
    let response = ureq::get(url)
        .call()
        .with_context(|| format!("failed to request {url}"))?;
    let reader = response.into_body().into_reader();

    let partial = partial_path(target);
    let written = copy_chunked(reader, &partial).with_context(|| format!("failed to download {url}"));
    match written {
        Ok(len) => {
            tracing::debug!(url, len, "download complete");
            fs_err::rename(&partial, target)?;
            Ok(())
        }
        Err(err) => {
            let _ = fs_err::remove_file(&partial);
            Err(err)
        }
    }
}

fn partial_path(target: &Path) -> std::path::PathBuf {
    let mut name = target.file_name().unwrap_or_default().to_owned();
    name.push(".part");
    target.with_file_name(name)
}

fn copy_chunked(mut reader: impl Read, path: &Path) -> anyhow::Result<u64> {
    let mut file = fs_err::File::create(path)?;
    let mut chunk = [0; CHUNK_SIZE];
    let mut total = 0;
    loop {
        let n = match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        file.write_all(&chunk[..n])?;
        total += n as u64;
    }
    file.flush()?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn existing_target_is_not_fetched() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("qemu-kernel");
        fs_err::write(&target, b"cached").unwrap();
        // Never contacted: the target already exists.
        download("http://127.0.0.1:9/vmlinuz", &target).unwrap();
        assert_eq!(fs_err::read(&target).unwrap(), b"cached");
    }

    #[test]
    fn copies_in_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out");
        let data: Vec<u8> = (0..CHUNK_SIZE * 3 + 7).map(|i| i as u8).collect();
        let len = copy_chunked(data.as_slice(), &path).unwrap();
        assert_eq!(len, data.len() as u64);
        assert_eq!(fs_err::read(&path).unwrap(), data);
    }

    #[test]
    fn partial_file_is_a_sibling() {
        assert_eq!(
            partial_path(Path::new("/tmp/qemu-initrd")),
            Path::new("/tmp/qemu-initrd.part")
        );
    }
}
