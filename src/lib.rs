//! Spriter Project Resizer Library
//!
//! Core logic for rescaling a Spriter project. Shared between the CLI and any
//! embedding host.
//!
//! Streams the `.scml` document once, resamples every image referenced from a
//! `<file>` element with a progressive bleed/blur/bicubic chain, and patches
//! every pixel-unit attribute so the rewritten document matches the new
//! image resolution.

pub mod project;
pub mod resample;
pub mod rewrite;

use std::path::PathBuf;
use std::time::Duration;

pub use project::{spawn_resize, CancelToken, ProgressEvent, ProjectResizer, ResizeHandle};
pub use resample::{resample, FilterConfig};
pub use rewrite::{rewrite_document, AttributeRewriter, RewriteConfig};

/// Options for project resizing
#[derive(Debug, Clone)]
pub struct ResizeOptions {
    /// Uniform scale factor applied to image dimensions and pixel-unit attributes
    pub scale: f64,
    /// Radius of the binomial blur kernel run before every bicubic step
    pub blur_radius: usize,
}

impl Default for ResizeOptions {
    fn default() -> Self {
        Self {
            scale: 0.5,
            blur_radius: 2,
        }
    }
}

impl ResizeOptions {
    /// Validated scale factor
    pub fn scale_factor(&self) -> Result<ScaleFactor, ResizeError> {
        ScaleFactor::new(self.scale)
    }

    /// Validated filter configuration
    pub fn filter_config(&self) -> Result<FilterConfig, ResizeError> {
        let config = FilterConfig {
            blur_radius: self.blur_radius,
        };
        config.validate()?;
        Ok(config)
    }
}

/// A positive, finite uniform scale factor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaleFactor(f64);

impl ScaleFactor {
    pub fn new(value: f64) -> Result<Self, ResizeError> {
        if value.is_finite() && value > 0.0 {
            Ok(Self(value))
        } else {
            Err(ResizeError::InvalidScale(value))
        }
    }

    pub fn get(self) -> f64 {
        self.0
    }

    /// Multiply a linear distance by the factor
    pub fn scale_value(self, value: f64) -> f64 {
        value * self.0
    }

    /// Round-half-up scaling used for pixel dimensions: `floor(v * s + 0.5)`
    pub fn round_scaled(self, value: f64) -> f64 {
        (value * self.0 + 0.5).floor()
    }

    /// Calculate target pixel dimensions for an image of the given size.
    ///
    /// Fails instead of clamping when either side would round to zero or
    /// would not fit in a `u32`.
    pub fn scale_dimensions(self, width: u32, height: u32) -> Result<(u32, u32), ResizeError> {
        let target_width = self.round_scaled(width as f64);
        let target_height = self.round_scaled(height as f64);

        if target_width < 1.0 || target_height < 1.0 {
            return Err(ResizeError::ZeroDimension {
                width,
                height,
                scale: self.0,
            });
        }

        let limit = f64::from(u32::MAX);
        if target_width > limit || target_height > limit {
            return Err(ResizeError::DimensionTooLarge {
                width,
                height,
                scale: self.0,
            });
        }

        Ok((target_width as u32, target_height as u32))
    }
}

/// Error type for project resizing operations
#[derive(Debug, thiserror::Error)]
pub enum ResizeError {
    #[error("Input not found: {}", .0.display())]
    InputNotFound(PathBuf),

    #[error("Scale factor must be a positive finite number, got {0}")]
    InvalidScale(f64),

    #[error("Invalid output path: {0}")]
    InvalidOutputPath(String),

    #[error("Resampling filters unavailable: {0}")]
    FilterUnavailable(String),

    #[error("Failed to decode image {}: {message}", .path.display())]
    Decode { path: PathBuf, message: String },

    #[error("Resampling failed: {0}")]
    Resample(String),

    #[error("Failed to encode image {}: {message}", .path.display())]
    Encode { path: PathBuf, message: String },

    #[error("Scaling {width}x{height} by {scale} would produce a zero dimension")]
    ZeroDimension { width: u32, height: u32, scale: f64 },

    #[error("Scaling {width}x{height} by {scale} exceeds the maximum image dimension")]
    DimensionTooLarge { width: u32, height: u32, scale: f64 },

    #[error("File reference escapes the project directory: {0}")]
    UnsafeReference(String),

    #[error("Failed to parse document: {0}")]
    DocumentParse(String),

    #[error("Failed to write document: {0}")]
    DocumentWrite(#[source] std::io::Error),

    #[error("Failed to create directory {}: {source}", .path.display())]
    DirectoryCreation {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Resize cancelled")]
    Cancelled,
}

/// One image that could not be resized
#[derive(Debug, Clone)]
pub struct FileFailure {
    /// Reference exactly as written in the document
    pub file: String,
    pub message: String,
}

/// Overall outcome of a completed run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    PartialFailure,
    Failure,
}

/// Result of a project resize
#[derive(Debug, Clone, Default)]
pub struct ResizeReport {
    pub files_seen: usize,
    pub files_resized: usize,
    pub failures: Vec<FileFailure>,
    pub elapsed: Duration,
}

impl ResizeReport {
    pub fn status(&self) -> RunStatus {
        if self.failures.is_empty() {
            RunStatus::Success
        } else if self.files_resized > 0 {
            RunStatus::PartialFailure
        } else {
            RunStatus::Failure
        }
    }
}

pub mod file_ops {
    use super::*;
    use std::path::Path;

    /// Resize a project from document path to document path, reporting
    /// progress lines through `on_progress` as they are produced.
    pub fn resize_project_file(
        input_path: &Path,
        output_path: &Path,
        options: &ResizeOptions,
        on_progress: impl FnMut(&ProgressEvent),
    ) -> Result<ResizeReport, ResizeError> {
        let resizer = ProjectResizer::new(input_path, output_path, options)?;
        resizer.run(&CancelToken::new(), on_progress)
    }
}
