//! Bootloader image catalog.
//!
//! Every image the device can request is loaded once at startup and shared
//! read-only across sessions. A request token resolves to a backing image
//! plus a slice operation: the whole blob, its signed header, or its code
//! body.
//!
//! Each bootloader image carries a 4 KiB header ahead of its code body.
//! Byte 1040 of that header holds the "USB bootable" flag; `--usb-boot`
//! sets it at load time when it is clear.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::path::Path;

use rand::RngCore;

use crate::config::Config;

/// Offset of the "USB bootable" flag byte inside the image header.
const USB_BOOT_FLAG_OFFSET: usize = 1040;

/// Size of the zeroed DPM stand-in accepted by current silicon.
pub const DPM_SYNTH_LEN: usize = 12288;

/// Images the BootROM always walks through on current hardware.
const MANDATORY: &[ImageKind] = &[
    ImageKind::Bl1,
    ImageKind::Pbl,
    ImageKind::Bl2,
    ImageKind::Gsa,
    ImageKind::Abl,
    ImageKind::Tzsw,
    ImageKind::Ldfw,
    ImageKind::Bl31,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ImageKind {
    Bl1,
    Dpm,
    Pbl,
    Bl2,
    Gsa,
    Abl,
    Tzsw,
    Ldfw,
    Bl31,
    Gcf,
    Gsaf,
}

impl ImageKind {
    pub const fn name(self) -> &'static str {
        match self {
            ImageKind::Bl1 => "BL1",
            ImageKind::Dpm => "DPM",
            ImageKind::Pbl => "PBL",
            ImageKind::Bl2 => "BL2",
            ImageKind::Gsa => "GSA",
            ImageKind::Abl => "ABL",
            ImageKind::Tzsw => "TZSW",
            ImageKind::Ldfw => "LDFW",
            ImageKind::Bl31 => "BL31",
            ImageKind::Gcf => "GCF",
            ImageKind::Gsaf => "GSAF",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slice {
    Full,
    /// First `header` bytes.
    Head,
    /// Everything past `header`.
    Body,
}

/// Maps a request token to its backing image and slice. Ordered as the
/// device typically requests stages on current hardware.
pub fn lookup(token: &str) -> Option<(ImageKind, Slice)> {
    Some(match token {
        "BL1" => (ImageKind::Bl1, Slice::Full),
        "DPM" => (ImageKind::Dpm, Slice::Full),
        "EPBL" => (ImageKind::Pbl, Slice::Full),
        "BL2" => (ImageKind::Bl2, Slice::Head),
        "BL2B" => (ImageKind::Bl2, Slice::Body),
        "GSA1" => (ImageKind::Gsa, Slice::Full),
        "ABL" => (ImageKind::Abl, Slice::Head),
        "ABLB" => (ImageKind::Abl, Slice::Body),
        "TZSW" => (ImageKind::Tzsw, Slice::Head),
        "TZSB" => (ImageKind::Tzsw, Slice::Body),
        "LDFW" => (ImageKind::Ldfw, Slice::Head),
        "LDFB" => (ImageKind::Ldfw, Slice::Body),
        "BL31" => (ImageKind::Bl31, Slice::Head),
        "BL3B" => (ImageKind::Bl31, Slice::Body),
        "GCF" => (ImageKind::Gcf, Slice::Head),
        "GCFB" => (ImageKind::Gcf, Slice::Body),
        "GSAF" => (ImageKind::Gsaf, Slice::Full),
        _ => return None,
    })
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("source directory '{0}' does not exist")]
    MissingSourceDir(String),
    #[error("failed to read image '{0}': {1}")]
    Read(String, std::io::Error),
    #[error("image '{0}' is {1} bytes, too short to split at header size {2}")]
    TooShort(&'static str, usize, usize),
    #[error("unknown image requested: {0}")]
    UnknownImage(String),
    #[error("image '{0}' was not loaded and has no synthetic stand-in")]
    NotLoaded(&'static str),
}

/// The loaded catalog: immutable after construction.
#[derive(Debug, Default)]
pub struct Catalog {
    images: BTreeMap<ImageKind, Vec<u8>>,
    header: usize,
    fuzz_dpm: bool,
}

impl Catalog {
    /// Loads every configured image into memory. Mandatory images must
    /// load; GCF/GSAF/DPM are best-effort. Images backing a Head/Body
    /// split must be strictly longer than the header size.
    pub fn load(config: &Config) -> Result<Self, CatalogError> {
        if !config.src.is_dir() {
            return Err(CatalogError::MissingSourceDir(
                config.src.display().to_string(),
            ));
        }

        let mut catalog = Catalog {
            images: BTreeMap::new(),
            header: config.header,
            fuzz_dpm: config.fuzz_dpm,
        };

        for kind in MANDATORY {
            let path = config.image_path(*kind);
            let bytes = read_image(&config.src, &path, config.usb_boot)
                .map_err(|err| CatalogError::Read(path.display().to_string(), err))?;
            catalog.insert(*kind, bytes)?;
        }

        for kind in [ImageKind::Gcf, ImageKind::Gsaf] {
            let path = config.image_path(kind);
            if let Ok(bytes) = read_image(&config.src, &path, config.usb_boot) {
                catalog.insert(kind, bytes)?;
            } else {
                tracing::debug!("Optional image {} not found, skipping", kind.name());
            }
        }

        if let Some(path) = &config.dpm {
            let bytes = read_image(&config.src, path, config.usb_boot)
                .map_err(|err| CatalogError::Read(path.display().to_string(), err))?;
            catalog.insert(ImageKind::Dpm, bytes)?;
        }

        Ok(catalog)
    }

    fn insert(&mut self, kind: ImageKind, bytes: Vec<u8>) -> Result<(), CatalogError> {
        if needs_split(kind) && bytes.len() <= self.header {
            return Err(CatalogError::TooShort(kind.name(), bytes.len(), self.header));
        }
        tracing::debug!("Loaded {} ({} bytes)", kind.name(), bytes.len());
        self.images.insert(kind, bytes);
        Ok(())
    }

    /// Resolves a request token to the bytes that go on the wire.
    ///
    /// DPM is special: with no image loaded the device accepts a zeroed
    /// 12 KiB blob, or a freshly fuzzed one per request when enabled.
    pub fn resolve(&self, token: &str) -> Result<Cow<'_, [u8]>, CatalogError> {
        let Some((kind, slice)) = lookup(token) else {
            return Err(CatalogError::UnknownImage(token.to_owned()));
        };

        let bytes = match self.images.get(&kind) {
            Some(bytes) => bytes,
            None if kind == ImageKind::Dpm => {
                return Ok(Cow::Owned(self.synthesize_dpm()));
            }
            None => return Err(CatalogError::NotLoaded(kind.name())),
        };

        Ok(Cow::Borrowed(match slice {
            Slice::Full => &bytes[..],
            Slice::Head => &bytes[..self.header],
            Slice::Body => &bytes[self.header..],
        }))
    }

    fn synthesize_dpm(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; DPM_SYNTH_LEN];
        if self.fuzz_dpm {
            rand::thread_rng().fill_bytes(&mut bytes);
        }
        bytes
    }

    /// Builds a catalog straight from byte blobs, for session tests.
    #[cfg(test)]
    pub(crate) fn with_images(
        header: usize,
        entries: Vec<(ImageKind, Vec<u8>)>,
    ) -> Catalog {
        let mut catalog = Catalog {
            images: BTreeMap::new(),
            header,
            fuzz_dpm: false,
        };
        for (kind, bytes) in entries {
            catalog.insert(kind, bytes).unwrap();
        }
        catalog
    }
}

/// True for images served as separate Head and Body stages.
fn needs_split(kind: ImageKind) -> bool {
    matches!(
        kind,
        ImageKind::Bl2
            | ImageKind::Abl
            | ImageKind::Tzsw
            | ImageKind::Ldfw
            | ImageKind::Bl31
            | ImageKind::Gcf
    )
}

/// Reads an image, preferring the source directory and falling back to the
/// raw path. Applies the USB-boot header tweak when requested.
fn read_image(src: &Path, path: &Path, usb_boot: bool) -> std::io::Result<Vec<u8>> {
    let mut bytes = match std::fs::read(src.join(path)) {
        Ok(bytes) => bytes,
        Err(_) => std::fs::read(path)?,
    };
    apply_usb_boot_tweak(&mut bytes, usb_boot);
    Ok(bytes)
}

fn apply_usb_boot_tweak(bytes: &mut [u8], usb_boot: bool) {
    if usb_boot && bytes.len() > USB_BOOT_FLAG_OFFSET && bytes[USB_BOOT_FLAG_OFFSET] == 0 {
        bytes[USB_BOOT_FLAG_OFFSET] = 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_catalog(header: usize) -> Catalog {
        Catalog {
            images: BTreeMap::new(),
            header,
            fuzz_dpm: false,
        }
    }

    #[test]
    fn head_and_body_reassemble_the_image() {
        let mut catalog = test_catalog(4096);
        let image: Vec<u8> = (0..16384u32).map(|i| (i % 251) as u8).collect();
        catalog.insert(ImageKind::Bl2, image.clone()).unwrap();

        let head = catalog.resolve("BL2").unwrap().into_owned();
        let body = catalog.resolve("BL2B").unwrap().into_owned();

        assert_eq!(head.len(), 4096);
        assert_eq!(head, image[..4096]);
        assert_eq!(body, image[4096..]);

        let mut rejoined = head;
        rejoined.extend_from_slice(&body);
        assert_eq!(rejoined, image);
    }

    #[test]
    fn split_image_must_outsize_the_header() {
        let mut catalog = test_catalog(4096);
        let err = catalog.insert(ImageKind::Abl, vec![0u8; 4096]).unwrap_err();
        assert!(matches!(err, CatalogError::TooShort("ABL", 4096, 4096)));
    }

    #[test]
    fn full_image_of_any_size_is_accepted() {
        let mut catalog = test_catalog(4096);
        catalog.insert(ImageKind::Bl1, vec![7u8; 16]).unwrap();
        assert_eq!(catalog.resolve("BL1").unwrap().len(), 16);
    }

    #[test]
    fn missing_dpm_synthesizes_zeroes() {
        let catalog = test_catalog(4096);
        let dpm = catalog.resolve("DPM").unwrap();
        assert_eq!(dpm.len(), DPM_SYNTH_LEN);
        assert!(dpm.iter().all(|&b| b == 0));
    }

    #[test]
    fn fuzzed_dpm_differs_per_request() {
        let mut catalog = test_catalog(4096);
        catalog.fuzz_dpm = true;
        let first = catalog.resolve("DPM").unwrap().into_owned();
        let second = catalog.resolve("DPM").unwrap().into_owned();
        assert_eq!(first.len(), DPM_SYNTH_LEN);
        assert_ne!(first, second);
    }

    #[test]
    fn unknown_token_is_rejected() {
        let catalog = test_catalog(4096);
        assert!(matches!(
            catalog.resolve("ZZZ"),
            Err(CatalogError::UnknownImage(_))
        ));
    }

    #[test]
    fn epbl_resolves_to_full_pbl() {
        let mut catalog = test_catalog(4096);
        catalog.insert(ImageKind::Pbl, vec![3u8; 100]).unwrap();
        assert_eq!(catalog.resolve("EPBL").unwrap().len(), 100);
    }

    #[test]
    fn usb_boot_tweak_sets_clear_flag() {
        let mut bytes = vec![0u8; 4096];
        apply_usb_boot_tweak(&mut bytes, true);
        assert_eq!(bytes[USB_BOOT_FLAG_OFFSET], 1);
    }

    #[test]
    fn usb_boot_tweak_is_idempotent() {
        let mut bytes = vec![0u8; 4096];
        bytes[USB_BOOT_FLAG_OFFSET] = 1;
        let before = bytes.clone();
        apply_usb_boot_tweak(&mut bytes, true);
        assert_eq!(bytes, before);
    }

    #[test]
    fn usb_boot_tweak_disabled_is_a_no_op() {
        let mut bytes = vec![0u8; 4096];
        apply_usb_boot_tweak(&mut bytes, false);
        assert_eq!(bytes[USB_BOOT_FLAG_OFFSET], 0);
    }
}
