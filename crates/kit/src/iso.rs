//! Installation media and the download cache.

use std::fmt;
use std::io::Write as _;
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use indicatif::{ProgressBar, ProgressStyle};

use crate::config::exists;
use crate::VmmError;

/// Fetches a URL to a local file.
pub trait Downloader {
    /// Download `url` to `dest`, which must not be left partially written on failure.
    fn download(&self, url: &str, dest: &Utf8Path) -> Result<()>;
}

/// Blocking HTTP(S) downloads with a progress bar on stderr.
#[derive(Debug, Default)]
pub struct HttpDownloader;

impl Downloader for HttpDownloader {
    fn download(&self, url: &str, dest: &Utf8Path) -> Result<()> {
        (|| -> Result<()> {
            let dir = dest
                .parent()
                .ok_or_else(|| eyre!("Download target {dest} has no parent"))?;
            std::fs::create_dir_all(dir).with_context(|| format!("Creating {dir}"))?;

            tracing::info!("Downloading {url} to {dest}");
            let mut resp = reqwest::blocking::get(url)?.error_for_status()?;
            let bar = match resp.content_length() {
                Some(len) => ProgressBar::new(len).with_style(ProgressStyle::with_template(
                    "{msg} [{bar:40}] {binary_bytes}/{binary_total_bytes} ({eta})",
                )?),
                None => ProgressBar::new_spinner(),
            };
            bar.set_message(dest.file_name().unwrap_or(dest.as_str()).to_owned());

            // Written next to the target and renamed into place once complete
            let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
            std::io::copy(&mut resp, &mut bar.wrap_write(tmp.as_file_mut()))?;
            tmp.as_file_mut().flush()?;
            tmp.persist(dest)?;
            bar.finish_and_clear();
            Ok(())
        })()
        .wrap_err_with(|| format!("Downloading {url}"))
    }
}

/// Where the installation media comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IsoSource {
    /// Fetched once into the cache
    Url(String),
    /// A file that must already exist
    Path(Utf8PathBuf),
}

impl FromStr for IsoSource {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s.starts_with("http://") || s.starts_with("https://") {
            Ok(Self::Url(s.to_owned()))
        } else {
            Ok(Self::Path(s.into()))
        }
    }
}

impl fmt::Display for IsoSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Url(u) => f.write_str(u),
            Self::Path(p) => f.write_str(p.as_str()),
        }
    }
}

/// Last path component of a URL, without query or fragment.
fn url_file_name(url: &str) -> Result<&str> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('/')
        .next()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| eyre!("Cannot derive a file name from {url}"))
}

/// Download `url` into `dir` unless a file of the same name is already there.
pub fn fetch_cached(url: &str, dir: &Utf8Path, downloader: &dyn Downloader) -> Result<Utf8PathBuf> {
    let dest = dir.join(url_file_name(url)?);
    if exists(&dest)? {
        tracing::debug!("Using cached {dest}");
    } else {
        downloader.download(url, &dest)?;
    }
    Ok(dest)
}

impl IsoSource {
    /// Local path of the media, downloading it into `cache` if needed.
    pub fn resolve(&self, cache: &Utf8Path, downloader: &dyn Downloader) -> Result<Utf8PathBuf> {
        match self {
            Self::Url(url) => fetch_cached(url, cache, downloader),
            Self::Path(p) => {
                if !exists(p)? {
                    return Err(VmmError::MissingIso { path: p.clone() }.into());
                }
                Ok(p.clone())
            }
        }
    }
}

/// Emulator arguments attaching `iso` as a SCSI CD-ROM.
pub fn qemu_args(iso: &Utf8Path) -> Vec<String> {
    vec![
        "-device".into(),
        "virtio-scsi-pci,id=scsi0".into(),
        "-device".into(),
        "scsi-cd,drive=cd".into(),
        "-drive".into(),
        format!("if=none,format=raw,id=cd,file={iso}"),
    ]
}
