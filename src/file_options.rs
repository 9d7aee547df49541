use std::path::PathBuf;

use stacked_errors::{bail_locationless, Result, StackableErr};
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncReadExt, AsyncWriteExt},
};

use crate::{acquire_dir_path, acquire_file_path, close_file};

#[derive(Debug, Clone, Copy)]
pub struct WriteOptions {
    // creates file if nonexistent
    create: bool,
    // truncation by default, append otherwise
    append: bool,
}

#[derive(Debug, Clone, Copy)]
pub enum ReadOrWrite {
    Read,
    Write(WriteOptions),
}

/// A wrapper combining capabilities from `tokio::fs::{OpenOptions, File}` with
/// a lot of opinionated defaults and [`close_file`].
#[derive(Debug, Clone)]
pub struct FileOptions {
    pub path: PathBuf,
    pub options: ReadOrWrite,
}

impl FileOptions {
    pub fn read(file_path: impl Into<PathBuf>) -> Self {
        Self {
            path: file_path.into(),
            options: ReadOrWrite::Read,
        }
    }

    pub fn read2(directory: impl Into<PathBuf>, file_name: impl AsRef<std::path::Path>) -> Self {
        let mut path = directory.into();
        path.push(file_name);
        Self {
            path,
            options: ReadOrWrite::Read,
        }
    }

    /// Sets `create` to true and `append` to false by default
    pub fn write(file_path: impl Into<PathBuf>) -> Self {
        Self {
            path: file_path.into(),
            options: ReadOrWrite::Write(WriteOptions {
                create: true,
                append: false,
            }),
        }
    }

    /// Sets `create` to true and `append` to false by default
    pub fn write2(directory: impl Into<PathBuf>, file_name: impl AsRef<std::path::Path>) -> Self {
        let mut path = directory.into();
        path.push(file_name);
        Self {
            path,
            options: ReadOrWrite::Write(WriteOptions {
                create: true,
                append: false,
            }),
        }
    }

    pub fn create(mut self, create: bool) -> Result<Self> {
        if let ReadOrWrite::Write(ref mut options) = self.options {
            options.create = create;
            Ok(self)
        } else {
            bail_locationless!("{self:?}.create() -> options are readonly")
        }
    }

    pub fn append(mut self, append: bool) -> Result<Self> {
        if let ReadOrWrite::Write(ref mut options) = self.options {
            options.append = append;
            Ok(self)
        } else {
            bail_locationless!("{self:?}.append() -> options are readonly")
        }
    }

    /// Checks only for existence of the directory and file (allowing the file
    /// to not exist if `create` is set). Returns the combined path if
    /// `create`, else returns the canonicalized combined path.
    pub async fn preacquire(&self) -> Result<PathBuf> {
        let dir = self
            .path
            .parent()
            .stack_err_with(|| format!("{self:?}.preacquire() -> empty path"))?;
        let dir = if dir.as_os_str().is_empty() {
            std::path::Path::new(".")
        } else {
            dir
        };
        let dir = acquire_dir_path(dir).await.stack_err_with(|| {
            format!("{self:?}.preacquire() could not acquire directory")
        })?;
        let file_name = self
            .path
            .file_name()
            .stack_err_with(|| format!("{self:?}.preacquire() -> path has no file name"))?;
        let combined = dir.join(file_name);
        match self.options {
            ReadOrWrite::Read => acquire_file_path(&combined).await.stack_err_with(|| {
                format!("{self:?}.preacquire() could not acquire combined path")
            }),
            ReadOrWrite::Write(WriteOptions { create, .. }) => {
                if create {
                    Ok(combined)
                } else {
                    acquire_file_path(&combined).await.stack_err_with(|| {
                        format!("{self:?}.preacquire() could not acquire combined path")
                    })
                }
            }
        }
    }

    pub async fn acquire_file(&self) -> Result<File> {
        let path = self
            .preacquire()
            .await
            .stack_err("FileOptions::acquire_file()")?;
        Ok(match self.options {
            ReadOrWrite::Read => OpenOptions::new()
                .read(true)
                .open(&path)
                .await
                .stack_err_with(|| format!("{self:?}.acquire_file()"))?,
            ReadOrWrite::Write(WriteOptions { create, append }) => OpenOptions::new()
                .write(true)
                .create(create)
                .truncate(!append)
                .append(append)
                .open(&path)
                .await
                .stack_err_with(|| format!("{self:?}.acquire_file()"))?,
        })
    }

    pub async fn read_to_string(file_path: impl Into<PathBuf>) -> Result<String> {
        let mut file = Self::read(file_path)
            .acquire_file()
            .await
            .stack_err("read_to_string")?;
        let mut s = String::new();
        file.read_to_string(&mut s).await.stack_err("read_to_string")?;
        Ok(s)
    }

    pub async fn write_str(file_path: impl Into<PathBuf>, s: &str) -> Result<()> {
        let mut file = Self::write(file_path)
            .acquire_file()
            .await
            .stack_err("write_str")?;
        file.write_all(s.as_bytes()).await.stack_err("write_str")?;
        close_file(file).await.stack_err("write_str")?;
        Ok(())
    }
}
