use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::{Arc, OnceLock},
    time::Duration,
};

use anyhow::Context;
use futures_util::StreamExt;
use tokio::sync::Mutex;

const MAX_DOWNLOAD_BYTES: u64 = 512 * 1024 * 1024;
const DOWNLOAD_ATTEMPTS: u32 = 3;

/// Fetches and unpacks the archives provisioning needs.
#[async_trait::async_trait]
pub trait ArtifactSource: Send + Sync {
    /// Downloads `url` to `dest` unless a non-empty file is already there.
    async fn fetch(&self, url: &str, dest: &Path) -> anyhow::Result<PathBuf>;

    /// Unpacks `archive` into `dest_dir` and returns `dest_dir`.
    async fn extract(&self, archive: &Path, dest_dir: &Path) -> anyhow::Result<PathBuf>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HttpArtifacts;

#[async_trait::async_trait]
impl ArtifactSource for HttpArtifacts {
    async fn fetch(&self, url: &str, dest: &Path) -> anyhow::Result<PathBuf> {
        if is_cached(dest) {
            tracing::debug!(path = %dest.display(), "download cache hit");
            return Ok(dest.to_path_buf());
        }

        let lock = lock_for(&dest.to_string_lossy());
        let _guard = lock.lock().await;
        if is_cached(dest) {
            return Ok(dest.to_path_buf());
        }

        let mut last_err: Option<anyhow::Error> = None;
        for attempt in 1..=DOWNLOAD_ATTEMPTS {
            match download_to_path(url, dest).await {
                Ok(bytes) => {
                    tracing::info!(%url, path = %dest.display(), bytes, "downloaded");
                    return Ok(dest.to_path_buf());
                }
                Err(e) => {
                    tracing::warn!(%url, attempt, error = %e, "download failed");
                    last_err = Some(e);
                    if attempt < DOWNLOAD_ATTEMPTS {
                        tokio::time::sleep(Duration::from_millis(
                            200_u64.saturating_mul(2_u64.pow(attempt - 1)),
                        ))
                        .await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("download failed: {url}")))
    }

    async fn extract(&self, archive: &Path, dest_dir: &Path) -> anyhow::Result<PathBuf> {
        let archive = archive.to_path_buf();
        let dest_dir = dest_dir.to_path_buf();
        tokio::task::spawn_blocking(move || {
            extract_archive(&archive, &dest_dir)?;
            Ok(dest_dir)
        })
        .await
        .context("join extract task")?
    }
}

fn is_cached(path: &Path) -> bool {
    fs::metadata(path).is_ok_and(|m| m.is_file() && m.len() > 0)
}

fn download_locks() -> &'static std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>> {
    static LOCKS: OnceLock<std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>> = OnceLock::new();
    LOCKS.get_or_init(|| std::sync::Mutex::new(HashMap::new()))
}

fn lock_for(key: &str) -> Arc<Mutex<()>> {
    let mut map = download_locks().lock().unwrap_or_else(|e| e.into_inner());
    map.entry(key.to_string())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

pub(crate) fn http_client() -> &'static reqwest::Client {
    static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
    CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .user_agent(concat!("piobridge/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(15 * 60))
            .build()
            .expect("failed to build reqwest client")
    })
}

async fn download_to_path(url: &str, path: &Path) -> anyhow::Result<u64> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let resp = http_client()
        .get(url)
        .send()
        .await
        .with_context(|| format!("download {url}"))?
        .error_for_status()
        .with_context(|| format!("download {url} (status)"))?;

    let tmp = path.with_extension("part");
    let mut f = tokio::fs::File::create(&tmp).await?;
    let mut total: u64 = 0;
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(e).with_context(|| format!("read body of {url}"));
            }
        };
        total = total.saturating_add(chunk.len() as u64);
        if total > MAX_DOWNLOAD_BYTES {
            let _ = tokio::fs::remove_file(&tmp).await;
            anyhow::bail!("download too large: {url}");
        }
        tokio::io::AsyncWriteExt::write_all(&mut f, &chunk).await?;
    }
    tokio::io::AsyncWriteExt::flush(&mut f).await?;
    drop(f);
    tokio::fs::rename(&tmp, path).await?;
    Ok(total)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArchiveKind {
    TarGz,
    Zip,
}

impl ArchiveKind {
    fn detect(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_ascii_lowercase();
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(Self::TarGz)
        } else if name.ends_with(".zip") {
            Some(Self::Zip)
        } else {
            None
        }
    }
}

fn extract_archive(archive: &Path, dest_dir: &Path) -> anyhow::Result<()> {
    let kind = ArchiveKind::detect(archive)
        .with_context(|| format!("unsupported archive format: {}", archive.display()))?;
    fs::create_dir_all(dest_dir)?;
    match kind {
        ArchiveKind::TarGz => extract_tar_gz(archive, dest_dir),
        ArchiveKind::Zip => extract_zip(archive, dest_dir),
    }
}

fn extract_tar_gz(archive: &Path, dest_dir: &Path) -> anyhow::Result<()> {
    let f = fs::File::open(archive).with_context(|| format!("open {}", archive.display()))?;
    let mut tar = tar::Archive::new(flate2::read::GzDecoder::new(f));
    // `unpack` refuses entries that would land outside `dest_dir`.
    tar.unpack(dest_dir)
        .with_context(|| format!("extract {}", archive.display()))?;
    Ok(())
}

fn extract_zip(archive: &Path, dest_dir: &Path) -> anyhow::Result<()> {
    let f = fs::File::open(archive).with_context(|| format!("open {}", archive.display()))?;
    let mut zip = zip::ZipArchive::new(f).context("open zip archive")?;

    for i in 0..zip.len() {
        let mut entry = zip.by_index(i).context("read zip entry")?;
        let Some(rel) = entry.enclosed_name() else {
            tracing::warn!(name = %entry.name(), "skipping zip entry outside of target dir");
            continue;
        };
        let out_path = dest_dir.join(rel);

        if entry.is_dir() {
            fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = fs::File::create(&out_path)
            .with_context(|| format!("create {}", out_path.display()))?;
        std::io::copy(&mut entry, &mut out).context("extract zip entry")?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&out_path, fs::Permissions::from_mode(mode & 0o777))?;
        }
    }
    Ok(())
}

/// Walks `root` up to `max_depth` levels and returns the first file named
/// `name`, in sorted order.
pub fn find_file(root: &Path, name: &str, max_depth: usize) -> Option<PathBuf> {
    fn walk(cur: &Path, name: &str, depth: usize, out: &mut Vec<PathBuf>) {
        let Ok(rd) = fs::read_dir(cur) else {
            return;
        };
        for e in rd.flatten() {
            let p = e.path();
            let Ok(ty) = e.file_type() else {
                continue;
            };
            if ty.is_dir() {
                if depth > 0 {
                    walk(&p, name, depth - 1, out);
                }
            } else if ty.is_file() && p.file_name().and_then(|s| s.to_str()) == Some(name) {
                out.push(p);
            }
        }
    }

    let mut hits = Vec::new();
    walk(root, name, max_depth, &mut hits);
    hits.sort();
    hits.into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn write_tar_gz(path: &Path, files: &[(&str, &[u8])]) {
        let f = fs::File::create(path).unwrap();
        let gz = flate2::write::GzEncoder::new(f, flate2::Compression::default());
        let mut builder = tar::Builder::new(gz);
        for (name, data) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn archive_kind_from_name() {
        assert_eq!(
            ArchiveKind::detect(Path::new("virtualenv-16.7.12.tar.gz")),
            Some(ArchiveKind::TarGz)
        );
        assert_eq!(ArchiveKind::detect(Path::new("x.TGZ")), Some(ArchiveKind::TarGz));
        assert_eq!(ArchiveKind::detect(Path::new("develop.zip")), Some(ArchiveKind::Zip));
        assert_eq!(ArchiveKind::detect(Path::new("python.msi")), None);
    }

    #[tokio::test]
    async fn extracts_tar_gz_and_finds_script() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("virtualenv.tar.gz");
        write_tar_gz(
            &archive,
            &[
                ("virtualenv-16.7.12/setup.py", b"# setup"),
                ("virtualenv-16.7.12/virtualenv.py", b"print('venv')"),
            ],
        );

        let out = dir.path().join("out");
        let extracted = HttpArtifacts.extract(&archive, &out).await.unwrap();
        assert_eq!(extracted, out);

        let script = find_file(&out, "virtualenv.py", 4).unwrap();
        assert_eq!(fs::read_to_string(script).unwrap(), "print('venv')");
        assert!(find_file(&out, "missing.py", 4).is_none());
    }

    #[tokio::test]
    async fn extracts_zip() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("pkg.zip");
        {
            let f = fs::File::create(&archive).unwrap();
            let mut zip = zip::ZipWriter::new(f);
            let opts = zip::write::SimpleFileOptions::default();
            zip.add_directory("pkg/", opts).unwrap();
            zip.start_file("pkg/readme.txt", opts).unwrap();
            zip.write_all(b"hi").unwrap();
            zip.finish().unwrap();
        }

        let out = dir.path().join("out");
        HttpArtifacts.extract(&archive, &out).await.unwrap();
        assert_eq!(fs::read_to_string(out.join("pkg/readme.txt")).unwrap(), "hi");
    }

    #[tokio::test]
    async fn rejects_unknown_archive() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("python.msi");
        fs::write(&archive, b"x").unwrap();
        let err = HttpArtifacts
            .extract(&archive, &dir.path().join("out"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unsupported archive format"));
    }

    #[tokio::test]
    async fn fetch_is_idempotent_by_destination() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("cached.tar.gz");
        fs::write(&dest, b"already here").unwrap();

        // The URL is never contacted when the destination exists.
        let got = HttpArtifacts
            .fetch("http://127.0.0.1:9/never", &dest)
            .await
            .unwrap();
        assert_eq!(got, dest);
        assert_eq!(fs::read(&dest).unwrap(), b"already here");
    }

    #[tokio::test]
    async fn fetch_downloads_into_cache_path() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = sock.read(&mut buf).await;
            sock.write_all(
                b"HTTP/1.1 200 OK\r\nContent-Length: 7\r\nConnection: close\r\n\r\npayload",
            )
            .await
            .unwrap();
            sock.shutdown().await.ok();
        });

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("nested").join("file.bin");
        HttpArtifacts
            .fetch(&format!("http://{addr}/file.bin"), &dest)
            .await
            .unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"payload");
        assert!(!dest.with_extension("part").exists());
    }
}
