use super::stream::{ReadSeek, StreamFactory};
use super::ImageRegistry;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error};

pub const FILE_MODE: u32 = 0o444;
pub const DIRECTORY_MODE: u32 = 0o755;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    pub mode: u32,
    pub is_dir: bool,
}

#[derive(Debug, Error)]
pub enum OpenError {
    #[error("image {0} is not registered")]
    NotFound(String),
    #[error("failed to generate image {name}: {source}")]
    Stream {
        name: String,
        #[source]
        source: io::Error,
    },
}

/// The single directory of the image file system, listing every registered image.
///
/// Listed sizes come from [`StreamFactory::size_hint`] and are 0 when the factory cannot tell
/// without building the image.
#[derive(Debug)]
pub struct RootDirectory {
    entries: Vec<FileInfo>,
}

impl RootDirectory {
    pub fn info(&self) -> FileInfo {
        FileInfo {
            name: "/".to_string(),
            size: 0,
            mode: DIRECTORY_MODE,
            is_dir: true,
        }
    }

    pub fn entries(&self) -> &[FileInfo] {
        &self.entries
    }
}

/// A freshly generated image stream. Its size is exact, measured when it was opened.
pub struct ImageFile {
    info: FileInfo,
    reader: Box<dyn ReadSeek>,
}

impl ImageFile {
    pub fn info(&self) -> &FileInfo {
        &self.info
    }
}

impl Read for ImageFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

impl Seek for ImageFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.reader.seek(pos)
    }
}

pub enum Entry {
    RootDirectory(RootDirectory),
    RegisteredFile(ImageFile),
}

impl Entry {
    pub fn info(&self) -> FileInfo {
        match self {
            Entry::RootDirectory(dir) => dir.info(),
            Entry::RegisteredFile(file) => file.info().clone(),
        }
    }
}

fn is_a_directory() -> io::Error {
    io::Error::new(io::ErrorKind::IsADirectory, "is a directory")
}

impl Read for Entry {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Entry::RootDirectory(_) => Err(is_a_directory()),
            Entry::RegisteredFile(file) => file.read(buf),
        }
    }
}

impl Seek for Entry {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match self {
            Entry::RootDirectory(_) => Err(is_a_directory()),
            Entry::RegisteredFile(file) => file.seek(pos),
        }
    }
}

/// Read-only view of the registry as a flat directory of image files.
pub struct ImageFileSystem {
    registry: Arc<ImageRegistry>,
    factory: Arc<dyn StreamFactory>,
    base_image: PathBuf,
}

impl ImageFileSystem {
    pub fn new(
        registry: Arc<ImageRegistry>,
        factory: Arc<dyn StreamFactory>,
        base_image: impl Into<PathBuf>,
    ) -> Self {
        Self {
            registry,
            factory,
            base_image: base_image.into(),
        }
    }

    pub fn base_image(&self) -> &Path {
        &self.base_image
    }

    /// Opens `path`, generating a new image stream for every call. Blocks while the factory
    /// builds the stream.
    pub fn open(&self, path: &str) -> Result<Entry, OpenError> {
        debug!("Open {}", path);
        let name = base_name(path);
        if name.is_empty() {
            return Ok(Entry::RootDirectory(self.root()));
        }

        let image = self
            .registry
            .lookup(name)
            .ok_or_else(|| OpenError::NotFound(name.to_string()))?;

        let stream_error = |source: io::Error| {
            error!("Failed to generate image {}: {}", name, source);
            OpenError::Stream {
                name: name.to_string(),
                source,
            }
        };
        let mut reader = self
            .factory
            .open(&self.base_image, &image.network_data)
            .map_err(stream_error)?;
        let size = reader.seek(SeekFrom::End(0)).map_err(stream_error)?;
        reader.rewind().map_err(stream_error)?;

        Ok(Entry::RegisteredFile(ImageFile {
            info: FileInfo {
                name: image.name,
                size,
                mode: FILE_MODE,
                is_dir: false,
            },
            reader,
        }))
    }

    pub fn root(&self) -> RootDirectory {
        let entries = self
            .registry
            .list()
            .into_iter()
            .map(|image| FileInfo {
                size: self
                    .factory
                    .size_hint(&self.base_image, &image.network_data)
                    .unwrap_or(0),
                name: image.name,
                mode: FILE_MODE,
                is_dir: false,
            })
            .collect();
        RootDirectory { entries }
    }
}

fn base_name(path: &str) -> &str {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default()
}
