//! # pdfium-fetch
//!
//! Find a usable [PDFium](https://pdfium.googlesource.com/pdfium/) shared
//! library for `pdfium-render`, downloading one on first use when nothing is
//! installed.
//!
//! ## Resolution order
//!
//! [`bind_pdfium`] tries, in order:
//!
//! 1. `PDFIUM_LIB_PATH` — an explicit library path.
//! 2. The per-version cache directory ([`pdfium_cache_dir`]).
//! 3. The system library search path (`Pdfium::bind_to_system_library`).
//! 4. A download of the platform archive from
//!    [bblanchon/pdfium-binaries](https://github.com/bblanchon/pdfium-binaries),
//!    extracted into the cache directory.
//!
//! ```rust,no_run
//! let pdfium = pdfium_fetch::bind_pdfium(None).expect("PDFium unavailable");
//! ```
//!
//! ## Environment variable overrides
//!
//! - `PDFIUM_LIB_PATH` — path to an existing pdfium library; skips download.
//! - `PDFIUM_FETCH_CACHE_DIR` — override the default cache directory.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use pdfium_render::prelude::Pdfium;
use thiserror::Error;
use tracing::{debug, info, warn};

/// The pdfium-binaries release tag used for downloads.
pub const PDFIUM_VERSION: &str = "7690";

const BASE_URL: &str = "https://github.com/bblanchon/pdfium-binaries/releases/download";

/// Progress observer for the one-off download: `(bytes_so_far, total_bytes)`.
pub type DownloadProgress<'a> = &'a dyn Fn(u64, Option<u64>);

/// Errors returned while locating or binding PDFium.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Unsupported platform for PDFium download: {os}/{arch}")]
    UnsupportedPlatform { os: String, arch: String },

    #[error("Cache directory error: {0}")]
    CacheDir(#[source] std::io::Error),

    #[error("Download failed: {0}")]
    Download(String),

    #[error("Archive extraction failed: {0}")]
    Extract(String),

    /// `libloading` / `pdfium-render` could not load the library.
    #[error("Failed to bind PDFium from '{path}': {reason}")]
    Bind { path: PathBuf, reason: String },
}

/// Where a bound library came from. Reported in logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LibrarySource {
    EnvOverride(PathBuf),
    Cached(PathBuf),
    System,
    Downloaded(PathBuf),
}

struct PlatformArchive {
    archive_name: &'static str,
    lib_path_in_archive: &'static str,
    lib_name: &'static str,
}

fn platform_archive() -> Result<PlatformArchive, FetchError> {
    let os = std::env::consts::OS;
    let arch = std::env::consts::ARCH;

    let (archive_name, lib_path_in_archive, lib_name) = match (os, arch) {
        ("macos", "aarch64") => ("pdfium-mac-arm64.tgz", "lib/libpdfium.dylib", "libpdfium.dylib"),
        ("macos", "x86_64") => ("pdfium-mac-x64.tgz", "lib/libpdfium.dylib", "libpdfium.dylib"),
        ("linux", "x86_64") => ("pdfium-linux-x64.tgz", "lib/libpdfium.so", "libpdfium.so"),
        ("linux", "aarch64") => ("pdfium-linux-arm64.tgz", "lib/libpdfium.so", "libpdfium.so"),
        ("windows", "x86_64") => ("pdfium-win-x64.tgz", "bin/pdfium.dll", "pdfium.dll"),
        ("windows", "aarch64") => ("pdfium-win-arm64.tgz", "bin/pdfium.dll", "pdfium.dll"),
        (os, arch) => {
            return Err(FetchError::UnsupportedPlatform {
                os: os.to_string(),
                arch: arch.to_string(),
            })
        }
    };

    Ok(PlatformArchive {
        archive_name,
        lib_path_in_archive,
        lib_name,
    })
}

/// Per-version cache directory for the downloaded library.
///
/// Defaults to `{cache_dir}/nougat-pdf2text/pdfium-{VERSION}`;
/// `PDFIUM_FETCH_CACHE_DIR` replaces the `{cache_dir}/nougat-pdf2text` part.
pub fn pdfium_cache_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("PDFIUM_FETCH_CACHE_DIR") {
        return PathBuf::from(dir).join(format!("pdfium-{PDFIUM_VERSION}"));
    }

    let base = dirs::cache_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".cache")))
        .unwrap_or_else(std::env::temp_dir);

    base.join("nougat-pdf2text")
        .join(format!("pdfium-{PDFIUM_VERSION}"))
}

/// Returns an on-disk library path from `PDFIUM_LIB_PATH` or the cache,
/// without touching the network.
pub fn locate_library() -> Option<(PathBuf, LibrarySource)> {
    if let Ok(p) = std::env::var("PDFIUM_LIB_PATH") {
        let path = PathBuf::from(p);
        if path.exists() {
            return Some((path.clone(), LibrarySource::EnvOverride(path)));
        }
        warn!(
            "PDFIUM_LIB_PATH '{}' does not exist; ignoring",
            path.display()
        );
    }

    let info = platform_archive().ok()?;
    let cached = pdfium_cache_dir().join(info.lib_name);
    cached
        .exists()
        .then(|| (cached.clone(), LibrarySource::Cached(cached)))
}

// Download happens at most once per process.
static DOWNLOADED: OnceLock<PathBuf> = OnceLock::new();

/// Download and extract the platform library into the cache directory,
/// returning its path. A no-op when the cache already holds it.
pub fn fetch_library(on_progress: Option<DownloadProgress<'_>>) -> Result<PathBuf, FetchError> {
    if let Some(path) = DOWNLOADED.get() {
        return Ok(path.clone());
    }

    let info = platform_archive()?;
    let cache_dir = pdfium_cache_dir();
    let lib_path = cache_dir.join(info.lib_name);

    if !lib_path.exists() {
        let url = format!(
            "{}/chromium%2F{}/{}",
            BASE_URL, PDFIUM_VERSION, info.archive_name
        );
        info!("Downloading PDFium {} from {}", PDFIUM_VERSION, url);

        std::fs::create_dir_all(&cache_dir).map_err(FetchError::CacheDir)?;
        let archive = download_bytes(&url, on_progress)?;
        extract_library(&archive, info.lib_path_in_archive, &lib_path)?;
        info!("PDFium cached at {}", lib_path.display());
    }

    let _ = DOWNLOADED.set(lib_path.clone());
    Ok(lib_path)
}

/// Bind to PDFium using the resolution order documented at crate level.
pub fn bind_pdfium(on_progress: Option<DownloadProgress<'_>>) -> Result<Pdfium, FetchError> {
    bind_pdfium_with_source(on_progress).map(|(pdfium, _)| pdfium)
}

/// Like [`bind_pdfium`], also reporting where the library came from.
pub fn bind_pdfium_with_source(
    on_progress: Option<DownloadProgress<'_>>,
) -> Result<(Pdfium, LibrarySource), FetchError> {
    if let Some((path, source)) = locate_library() {
        debug!("Binding PDFium from {:?}", source);
        return bind_pdfium_from_path(&path).map(|p| (p, source));
    }

    match Pdfium::bind_to_system_library() {
        Ok(bindings) => {
            debug!("Binding PDFium from the system library path");
            return Ok((Pdfium::new(bindings), LibrarySource::System));
        }
        Err(e) => debug!("No system PDFium library: {:?}", e),
    }

    let path = fetch_library(on_progress)?;
    let pdfium = bind_pdfium_from_path(&path)?;
    Ok((pdfium, LibrarySource::Downloaded(path)))
}

/// Bind to a PDFium library at an explicit `path`.
pub fn bind_pdfium_from_path(path: &Path) -> Result<Pdfium, FetchError> {
    Pdfium::bind_to_library(path)
        .map(Pdfium::new)
        .map_err(|e| FetchError::Bind {
            path: path.to_path_buf(),
            reason: format!("{e:?}"),
        })
}

fn download_bytes(
    url: &str,
    on_progress: Option<DownloadProgress<'_>>,
) -> Result<Vec<u8>, FetchError> {
    let client = reqwest::blocking::Client::builder()
        .user_agent(concat!("pdfium-fetch/", env!("CARGO_PKG_VERSION")))
        .redirect(reqwest::redirect::Policy::limited(5))
        .build()
        .map_err(|e| FetchError::Download(e.to_string()))?;

    let mut response = client
        .get(url)
        .send()
        .map_err(|e| FetchError::Download(format!("GET {url}: {e}")))?;

    if !response.status().is_success() {
        return Err(FetchError::Download(format!(
            "HTTP {} for {url}",
            response.status()
        )));
    }

    let total = response.content_length();
    let mut buf = Vec::with_capacity(total.unwrap_or(32 * 1024 * 1024) as usize);
    let mut chunk = vec![0u8; 64 * 1024];
    let mut downloaded: u64 = 0;

    loop {
        match response.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                downloaded += n as u64;
                if let Some(cb) = on_progress {
                    cb(downloaded, total);
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(FetchError::Download(format!("Read error: {e}"))),
        }
    }

    Ok(buf)
}

/// Extract one file from a gzipped tar archive into `dest_path`.
fn extract_library(
    archive_bytes: &[u8],
    lib_path_in_archive: &str,
    dest_path: &Path,
) -> Result<(), FetchError> {
    use flate2::read::GzDecoder;
    use tar::Archive;

    let mut archive = Archive::new(GzDecoder::new(archive_bytes));
    let entries = archive
        .entries()
        .map_err(|e| FetchError::Extract(e.to_string()))?;

    for entry in entries {
        let mut entry = entry.map_err(|e| FetchError::Extract(e.to_string()))?;
        let matches = entry
            .path()
            .map_err(|e| FetchError::Extract(e.to_string()))?
            .to_string_lossy()
            == lib_path_in_archive;

        if matches {
            entry
                .unpack(dest_path)
                .map_err(|e| FetchError::Extract(format!("Unpack failed: {e}")))?;
            return Ok(());
        }
    }

    Err(FetchError::Extract(format!(
        "'{lib_path_in_archive}' not found in archive"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    fn tar_gz_with(name: &str, contents: &[u8]) -> Vec<u8> {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::fast()));
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, contents).unwrap();
        builder.into_inner().unwrap().finish().unwrap()
    }

    #[test]
    fn cache_dir_is_versioned() {
        let d = pdfium_cache_dir();
        assert_eq!(d, pdfium_cache_dir());
        assert!(d.to_str().unwrap().contains(PDFIUM_VERSION));
    }

    #[test]
    fn extract_library_finds_named_entry() {
        let archive = tar_gz_with("lib/libpdfium.so", b"fake-elf");
        let dir = std::env::temp_dir().join(format!("pdfium-fetch-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let dest = dir.join("libpdfium.so");

        extract_library(&archive, "lib/libpdfium.so", &dest).unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"fake-elf");

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn extract_library_reports_missing_entry() {
        let archive = tar_gz_with("lib/other.so", b"x");
        let err = extract_library(&archive, "lib/libpdfium.so", Path::new("/nonexistent"))
            .unwrap_err();
        assert!(matches!(err, FetchError::Extract(_)));
        assert!(err.to_string().contains("lib/libpdfium.so"));
    }

    #[test]
    fn bind_from_missing_path_fails() {
        let err = bind_pdfium_from_path(Path::new("/definitely/not/libpdfium.so")).unwrap_err();
        assert!(matches!(err, FetchError::Bind { .. }));
    }
}
