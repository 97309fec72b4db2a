use color_eyre::{eyre::eyre, Result};
use tracing::info;
use v4l::{capability::Flags, video::Capture, Device};

use crate::capture::PixelFormat;

// Detected capture device info
#[derive(Debug, Clone)]
pub struct FoundDevice {
    pub path: String,
    pub format: PixelFormat,
}

/// Find the first streaming capture device that can deliver compressed frames
pub fn auto_detect_device() -> Result<FoundDevice> {
    use std::path::Path;

    info!("Auto-detecting capture devices...");

    for i in 0..10 {
        let path = format!("/dev/video{}", i);
        if !Path::new(&path).exists() {
            continue;
        }

        let Ok(dev) = Device::with_path(&path) else {
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        if !caps
            .capabilities
            .contains(Flags::VIDEO_CAPTURE | Flags::STREAMING)
        {
            continue;
        }

        if let Ok(formats) = dev.enum_formats() {
            // Prefer MJPEG, the common case for UVC cameras
            let mut offered: Vec<PixelFormat> = formats
                .iter()
                .filter_map(|fmt| PixelFormat::from_fourcc(fmt.fourcc))
                .collect();
            offered.sort_by_key(|f| *f != PixelFormat::Mjpeg);

            if let Some(format) = offered.first().copied() {
                info!("Found {:?} device: {} - {}", format, path, caps.card);
                return Ok(FoundDevice { path, format });
            }
        }
    }

    Err(eyre!("No capture device offering MJPEG or JPEG found"))
}
