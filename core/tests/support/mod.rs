//! Fixture shared by the integration tests.
//!
//! A shell script stands in for ffmpeg: it writes the file named by `-i` to
//! stdout, so bitmaps written here come back through a real child process and
//! pipe. Source prefixes change its behaviour:
//!
//! - `slow:` sleeps for a second first
//! - `trailing:` keeps writing zeros for a while after the file
//!
//! Each test binary installs into its own directory under Cargo's target
//! tmpdir, replacing whatever the previous run left there.

#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use coersion_common::config::FfmpegConfig;
use coersion_common::frame::FrameRequest;
use coersion_core::FramePipeline;
use image::{ImageFormat, Rgb, RgbImage};

const FAKE_PRODUCER: &str = r#"#!/bin/sh
while [ $# -gt 0 ]; do
  if [ "$1" = "-i" ]; then
    case "$2" in
      slow:*) sleep 1; exec cat "${2#slow:}" ;;
      trailing:*) cat "${2#trailing:}" && sleep 0.2 && head -c 200000 /dev/zero; exit $? ;;
      *) exec cat "$2" ;;
    esac
  fi
  shift
done
echo "no input given" >&2
exit 2
"#;

pub struct Fixture {
    dir: PathBuf,
    pub config: FfmpegConfig,
}

impl Fixture {
    /// Write the script and bitmaps. Call once per test binary: a script
    /// rewritten while another test forks can fail to exec.
    pub fn install(name: &str) -> Self {
        let dir = Path::new(env!("CARGO_TARGET_TMPDIR")).join(name);
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();

        let script = dir.join("fake-ffmpeg");
        std::fs::write(&script, FAKE_PRODUCER).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        write_bmp(&dir, "red.bmp", RgbImage::from_pixel(2, 2, Rgb([255, 0, 0])));
        write_bmp(&dir, "red_shifted.bmp", RgbImage::from_pixel(2, 2, Rgb([255, 10, 0])));
        write_bmp(&dir, "blue.bmp", RgbImage::from_pixel(2, 2, Rgb([0, 0, 255])));
        write_bmp(&dir, "red_4x4.bmp", RgbImage::from_pixel(4, 4, Rgb([255, 0, 0])));
        write_bmp(
            &dir,
            "half.bmp",
            RgbImage::from_fn(2, 2, |_, y| if y == 0 { Rgb([255, 0, 0]) } else { Rgb([0, 0, 255]) }),
        );

        let config = FfmpegConfig {
            binary: script.display().to_string(),
            detach_grace_secs: 5,
            ..FfmpegConfig::default()
        };
        Fixture { dir, config }
    }

    pub fn path(&self, name: &str) -> String {
        self.dir.join(name).display().to_string()
    }

    /// A 2x2 request for `name`, which may carry a source prefix.
    pub fn request(&self, name: &str) -> FrameRequest {
        let source = match name.split_once(':') {
            Some((prefix, file)) => format!("{prefix}:{}", self.path(file)),
            None => self.path(name),
        };
        FrameRequest::new(source, 2, 2, Duration::ZERO).unwrap()
    }

    pub fn pipeline(&self) -> FramePipeline {
        FramePipeline::new(self.config.clone())
    }
}

fn write_bmp(dir: &Path, name: &str, img: RgbImage) {
    img.save_with_format(dir.join(name), ImageFormat::Bmp).unwrap();
}
