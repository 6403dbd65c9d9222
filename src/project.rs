//! Project resize pipeline.
//!
//! Walks the `.scml` document once through [`rewrite_document`]. Every
//! `<file name="...">` element triggers a resample of the referenced image
//! into the mirrored output tree, and the element's `width`/`height` are then
//! patched from the size actually produced. The other pixel-unit attributes
//! are multiplied by the scale factor.

use std::fmt;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use image::{DynamicImage, ImageFormat, RgbaImage};
use tempfile::NamedTempFile;

use crate::resample::{resample, FilterConfig};
use crate::rewrite::{rewrite_document, AttributeRewriter, RewriteConfig};
use crate::{FileFailure, ResizeError, ResizeOptions, ResizeReport, ScaleFactor};

/// How a patched attribute gets its new value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttributeRule {
    /// Width of the image just written for this element
    FileWidth,
    /// Height of the image just written for this element
    FileHeight,
    /// Decimal value multiplied by the scale factor
    Scale,
}

const SCALED_ATTRIBUTES: &[(&str, &str, AttributeRule)] = &[
    ("file", "width", AttributeRule::FileWidth),
    ("file", "height", AttributeRule::FileHeight),
    ("obj_info", "w", AttributeRule::Scale),
    ("obj_info", "h", AttributeRule::Scale),
    ("bone", "x", AttributeRule::Scale),
    ("bone", "y", AttributeRule::Scale),
    ("object", "x", AttributeRule::Scale),
    ("object", "y", AttributeRule::Scale),
];

fn attribute_rule(element: &str, attribute: &str) -> Option<AttributeRule> {
    SCALED_ATTRIBUTES
        .iter()
        .find(|(e, a, _)| *e == element && *a == attribute)
        .map(|(_, _, rule)| *rule)
}

/// Format with at most 6 fractional digits, trailing zeros and a trailing
/// decimal point removed.
pub fn format_scaled_value(value: f64) -> String {
    let mut text = format!("{:.6}", value);
    if text.contains('.') {
        let trimmed = text.trim_end_matches('0').trim_end_matches('.').len();
        text.truncate(trimmed);
    }
    if text == "-0" {
        text = "0".to_string();
    }
    text
}

/// One line of human-readable progress
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Started {
        input: PathBuf,
        output: PathBuf,
        scale: f64,
    },
    Resizing {
        file: String,
    },
    FileFailed {
        file: String,
        message: String,
    },
    Completed {
        files_resized: usize,
        files_failed: usize,
    },
}

impl fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgressEvent::Started {
                input,
                output,
                scale,
            } => write!(
                f,
                "Resizing {} -> {} (scale {})",
                input.display(),
                output.display(),
                scale
            ),
            ProgressEvent::Resizing { file } => write!(f, "Resizing '{}'", file),
            ProgressEvent::FileFailed { file, message } => {
                write!(f, "Failed to resize '{}': {}", file, message)
            }
            ProgressEvent::Completed {
                files_resized,
                files_failed,
            } => write!(
                f,
                "Resize complete. {} resized, {} failed",
                files_resized, files_failed
            ),
        }
    }
}

/// Cooperative cancellation flag, checked before each file is processed.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Turn a document file reference into a relative path that stays inside
/// the project directory. Both `/` and `\` are accepted as separators.
fn normalize_reference(reference: &str) -> Result<PathBuf, ResizeError> {
    let unsafe_reference = || ResizeError::UnsafeReference(reference.to_string());

    if reference.starts_with('/') || reference.starts_with('\\') {
        return Err(unsafe_reference());
    }

    let mut relative = PathBuf::new();
    for part in reference.split(|c| c == '/' || c == '\\') {
        match part {
            "" | "." => continue,
            ".." => return Err(unsafe_reference()),
            // Drive letters and other prefixes
            _ if part.contains(':') => return Err(unsafe_reference()),
            _ => relative.push(part),
        }
    }

    if relative.as_os_str().is_empty()
        || !relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
    {
        return Err(unsafe_reference());
    }

    Ok(relative)
}

fn directory_of(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> ResizeError + '_ {
    move |source| ResizeError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn create_dir(path: &Path) -> Result<(), ResizeError> {
    fs::create_dir_all(path).map_err(|source| ResizeError::DirectoryCreation {
        path: path.to_path_buf(),
        source,
    })
}

/// Resizes one Spriter project into another directory.
#[derive(Debug, Clone)]
pub struct ProjectResizer {
    input_path: PathBuf,
    output_path: PathBuf,
    input_dir: PathBuf,
    output_dir: PathBuf,
    scale: ScaleFactor,
    filters: FilterConfig,
}

impl ProjectResizer {
    /// Validate options and paths without touching the file system.
    ///
    /// The output document must differ from the input document and must not
    /// live in the input document's directory.
    pub fn new(
        input_path: &Path,
        output_path: &Path,
        options: &ResizeOptions,
    ) -> Result<Self, ResizeError> {
        let scale = options.scale_factor()?;
        let filters = options.filter_config()?;

        if !input_path.is_file() {
            return Err(ResizeError::InputNotFound(input_path.to_path_buf()));
        }
        if output_path.file_name().is_none() {
            return Err(ResizeError::InvalidOutputPath(format!(
                "{} does not name a file",
                output_path.display()
            )));
        }

        let input_dir = directory_of(input_path);
        let output_dir = directory_of(output_path);

        let canonical_input = fs::canonicalize(input_path).map_err(io_error(input_path))?;
        if fs::canonicalize(output_path).ok().as_ref() == Some(&canonical_input) {
            return Err(ResizeError::InvalidOutputPath(
                "the output document cannot be the input document".to_string(),
            ));
        }

        let canonical_input_dir = fs::canonicalize(&input_dir).map_err(io_error(&input_dir))?;
        if let Ok(canonical_output_dir) = fs::canonicalize(&output_dir) {
            if canonical_output_dir == canonical_input_dir {
                return Err(ResizeError::InvalidOutputPath(
                    "the output directory cannot be the same as the input directory".to_string(),
                ));
            }
        }

        Ok(Self {
            input_path: input_path.to_path_buf(),
            output_path: output_path.to_path_buf(),
            input_dir,
            output_dir,
            scale,
            filters,
        })
    }

    /// Run the whole resize, reporting progress through `on_progress`.
    ///
    /// The output document is written to a temporary file next to its final
    /// location and only moved into place once the walk has finished, so a
    /// parse error or cancellation leaves no output document behind. Images
    /// already written by then are kept.
    pub fn run(
        &self,
        cancel: &CancelToken,
        mut on_progress: impl FnMut(&ProgressEvent),
    ) -> Result<ResizeReport, ResizeError> {
        let started = Instant::now();

        log::info!(
            "Resizing {:?} -> {:?} at scale {}",
            self.input_path,
            self.output_path,
            self.scale.get()
        );
        on_progress(&ProgressEvent::Started {
            input: self.input_path.clone(),
            output: self.output_path.clone(),
            scale: self.scale.get(),
        });

        create_dir(&self.output_dir)?;

        let input = File::open(&self.input_path).map_err(io_error(&self.input_path))?;
        let temp = NamedTempFile::new_in(&self.output_dir).map_err(io_error(&self.output_dir))?;

        let mut session = ResizeSession {
            resizer: self,
            cancel,
            on_progress: &mut on_progress,
            report: ResizeReport::default(),
        };

        let writer = rewrite_document(
            BufReader::new(input),
            BufWriter::new(temp),
            &RewriteConfig::spriter(),
            &mut session,
        )
        .map_err(|err| match err {
            ResizeError::DocumentWrite(source) => ResizeError::Io {
                path: self.output_path.clone(),
                source,
            },
            other => other,
        })?;
        let mut report = session.report;

        let temp = writer
            .into_inner()
            .map_err(|e| ResizeError::Io {
                path: self.output_path.clone(),
                source: e.into_error(),
            })?;
        temp.as_file()
            .sync_all()
            .map_err(io_error(&self.output_path))?;
        temp.persist(&self.output_path)
            .map_err(|e| ResizeError::Io {
                path: self.output_path.clone(),
                source: e.error,
            })?;

        report.elapsed = started.elapsed();
        log::info!(
            "Done in {:.2?}: {} of {} images resized, {} failed",
            report.elapsed,
            report.files_resized,
            report.files_seen,
            report.failures.len()
        );
        on_progress(&ProgressEvent::Completed {
            files_resized: report.files_resized,
            files_failed: report.failures.len(),
        });

        Ok(report)
    }

    /// Resample one referenced image into the output tree, returning the
    /// dimensions written.
    fn resize_file(&self, reference: &str) -> Result<(u32, u32), ResizeError> {
        let relative = normalize_reference(reference)?;
        let input_path = self.input_dir.join(&relative);
        let output_path = self.output_dir.join(&relative);

        if !input_path.is_file() {
            return Err(ResizeError::InputNotFound(input_path));
        }
        if let Some(parent) = output_path.parent() {
            create_dir(parent)?;
        }

        let bytes = fs::read(&input_path).map_err(io_error(&input_path))?;
        let decode_error = |e: image::ImageError| ResizeError::Decode {
            path: input_path.clone(),
            message: e.to_string(),
        };
        let format = image::guess_format(&bytes).map_err(decode_error)?;
        let source = image::load_from_memory_with_format(&bytes, format)
            .map_err(decode_error)?
            .to_rgba8();

        let (source_width, source_height) = source.dimensions();
        let (target_width, target_height) =
            self.scale.scale_dimensions(source_width, source_height)?;
        let resized = resample(&source, target_width, target_height, &self.filters)?;
        drop(source);

        log::info!(
            "  {}: {}x{} -> {}x{}",
            reference,
            source_width,
            source_height,
            target_width,
            target_height
        );

        write_image(resized, format, &output_path)?;
        Ok((target_width, target_height))
    }
}

/// Encode `image` in `format` and move it into place atomically
fn write_image(image: RgbaImage, format: ImageFormat, path: &Path) -> Result<(), ResizeError> {
    let dir = directory_of(path);
    let encode_error = |e: image::ImageError| ResizeError::Encode {
        path: path.to_path_buf(),
        message: e.to_string(),
    };

    let image = DynamicImage::ImageRgba8(image);
    let image = match format {
        // No alpha channel in these formats
        ImageFormat::Jpeg | ImageFormat::Bmp => DynamicImage::ImageRgb8(image.to_rgb8()),
        _ => image,
    };

    let mut temp = NamedTempFile::new_in(&dir).map_err(io_error(&dir))?;
    {
        let mut writer = BufWriter::new(temp.as_file_mut());
        image.write_to(&mut writer, format).map_err(encode_error)?;
        writer.flush().map_err(io_error(path))?;
    }
    temp.persist(path).map_err(|e| ResizeError::Io {
        path: path.to_path_buf(),
        source: e.error,
    })?;
    Ok(())
}

/// Result of handling one `<file>` element, visible only to that element's
/// attribute transforms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileOutcome {
    Resized { width: u32, height: u32 },
    Failed,
}

/// State of one run while the document is being walked
struct ResizeSession<'a> {
    resizer: &'a ProjectResizer,
    cancel: &'a CancelToken,
    on_progress: &'a mut dyn FnMut(&ProgressEvent),
    report: ResizeReport,
}

impl ResizeSession<'_> {
    /// Dimension for a `<file>` whose image was not resized: the element's
    /// own value under the same rounding rule as the images.
    fn fallback_dimension(&self, element: &str, attribute: &str, value: &str) -> String {
        match value.trim().parse::<f64>() {
            Ok(v) => {
                log::warn!(
                    "<{} {}=\"{}\"> has no resized image, scaling the attribute instead",
                    element,
                    attribute,
                    value
                );
                format_scaled_value(self.resizer.scale.round_scaled(v))
            }
            Err(_) => {
                log::warn!(
                    "<{} {}=\"{}\"> is not numeric, leaving it unchanged",
                    element,
                    attribute,
                    value
                );
                value.to_string()
            }
        }
    }
}

impl AttributeRewriter for ResizeSession<'_> {
    type Context = FileOutcome;

    fn on_reference(&mut self, _element: &str, reference: &str) -> Result<FileOutcome, ResizeError> {
        if self.cancel.is_cancelled() {
            log::info!("Cancelled before '{}'", reference);
            return Err(ResizeError::Cancelled);
        }

        self.report.files_seen += 1;
        (self.on_progress)(&ProgressEvent::Resizing {
            file: reference.to_string(),
        });

        // Everything raised for a single image is file-scoped
        match self.resizer.resize_file(reference) {
            Ok((width, height)) => {
                self.report.files_resized += 1;
                Ok(FileOutcome::Resized { width, height })
            }
            Err(err) => {
                log::warn!("Failed to resize '{}': {}", reference, err);
                let message = err.to_string();
                (self.on_progress)(&ProgressEvent::FileFailed {
                    file: reference.to_string(),
                    message: message.clone(),
                });
                self.report.failures.push(FileFailure {
                    file: reference.to_string(),
                    message,
                });
                Ok(FileOutcome::Failed)
            }
        }
    }

    fn should_transform(&self, element: &str, attribute: &str, _value: &str) -> bool {
        attribute_rule(element, attribute).is_some()
    }

    fn transform(
        &self,
        context: Option<&FileOutcome>,
        element: &str,
        attribute: &str,
        value: &str,
    ) -> String {
        match (attribute_rule(element, attribute), context) {
            (Some(AttributeRule::FileWidth), Some(FileOutcome::Resized { width, .. })) => {
                width.to_string()
            }
            (Some(AttributeRule::FileHeight), Some(FileOutcome::Resized { height, .. })) => {
                height.to_string()
            }
            (Some(AttributeRule::FileWidth | AttributeRule::FileHeight), _) => {
                self.fallback_dimension(element, attribute, value)
            }
            (Some(AttributeRule::Scale), _) => match value.trim().parse::<f64>() {
                Ok(v) => format_scaled_value(self.resizer.scale.scale_value(v)),
                Err(_) => {
                    log::warn!(
                        "<{} {}=\"{}\"> is not numeric, leaving it unchanged",
                        element,
                        attribute,
                        value
                    );
                    value.to_string()
                }
            },
            (None, _) => value.to_string(),
        }
    }
}

/// A resize running on a worker thread.
pub struct ResizeHandle {
    events: Receiver<ProgressEvent>,
    cancel: CancelToken,
    worker: JoinHandle<Result<ResizeReport, ResizeError>>,
}

impl ResizeHandle {
    /// Progress events in the order they were produced. The channel closes
    /// when the run ends.
    pub fn events(&self) -> &Receiver<ProgressEvent> {
        &self.events
    }

    /// Request cancellation before the next file
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Wait for the run to finish
    pub fn join(self) -> Result<ResizeReport, ResizeError> {
        match self.worker.join() {
            Ok(result) => result,
            Err(payload) => std::panic::resume_unwind(payload),
        }
    }
}

/// Validate on the calling thread, then run the resize on a worker thread
/// that delivers progress over a channel.
pub fn spawn_resize(
    input_path: &Path,
    output_path: &Path,
    options: &ResizeOptions,
) -> Result<ResizeHandle, ResizeError> {
    let resizer = ProjectResizer::new(input_path, output_path, options)?;
    let (sender, events) = mpsc::channel();
    let cancel = CancelToken::new();
    let worker_cancel = cancel.clone();

    let worker = thread::Builder::new()
        .name("spriter-resize".to_string())
        .spawn(move || {
            resizer.run(&worker_cancel, |event| {
                // The receiver may have been dropped; the run still completes
                let _ = sender.send(event.clone());
            })
        })
        .map_err(io_error(input_path))?;

    Ok(ResizeHandle {
        events,
        cancel,
        worker,
    })
}
