//! Imaging files from a directory walk into a volume set.

use std::fs::File;
use std::path::Path;

use log::{debug, info, warn};

use crate::buf::fill_buf;
use crate::error::Result;
use crate::resolver::Resolver;
use crate::spill::VolumeSpill;
use crate::stream::image::{Image, ImageOptions};
use crate::stream::Stream;
use crate::urn::{self, attr};

const READ_SIZE: usize = 1024 * 1024;

/// URN of the image holding the file at `path`.
pub fn image_urn(volume: &str, path: &Path) -> String {
    let name = path.to_string_lossy();
    format!("{}/{}", volume, urn::escape_filename(name.trim_start_matches('/')))
}

/// Image one file, returns the image URN.
pub fn acquire_file(resolver: &Resolver, volume: &str, path: &Path, options: &ImageOptions) -> Result<String> {
    let image = image_urn(volume, path);
    let mut file = File::open(path)?;

    let mut handle = Image::create(resolver, volume, &image, options)?;
    resolver.set(&image, attr::ORIGINAL_PATH, path.to_string_lossy());

    let mut buf = vec![0; READ_SIZE];
    loop {
        let (eof, n) = fill_buf(&mut file, &mut buf)?;
        handle.image()?.write_all(&buf[..n])?;
        if eof {
            break;
        }
    }
    let size = handle.image()?.size();
    handle.close()?;

    info!("Acquired {} as {} ({} bytes)", path.display(), image, size);
    Ok(image)
}

/// Image every regular file `walker` yields into the current volume of `spill`.
pub fn acquire(resolver: &Resolver, spill: &VolumeSpill, walker: ignore::Walk, options: &ImageOptions) -> Result<Vec<String>> {
    let mut images = Vec::new();

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("Skipping unreadable entry: {}", e);
                continue;
            }
        };

        match entry.file_type() {
            Some(ft) if ft.is_file() => {
                images.push(acquire_file(resolver, &spill.current(), entry.path(), options)?);
            }
            _ => debug!("Skipping {}", entry.path().display()),
        }
    }
    Ok(images)
}
