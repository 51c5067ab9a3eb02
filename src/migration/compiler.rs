//! [`MigrationCompiler`]: concatenates a numbered SQL source tree into a
//! single timestamped artifact.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::CompilerConfig;
use crate::errors::DeployError;
use crate::events::{DeployEvent, EventSink, SharedSink};

const COMPONENT: &str = "MigrationCompiler";

/// The result of a successful compilation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompiledArtifact {
    pub output_path: PathBuf,
    pub contents: String,
    pub files_processed: usize,
    pub lines_written: usize,
    pub directories: Vec<String>,
}

pub struct MigrationCompiler {
    config: CompilerConfig,
    sink: SharedSink,
}

/// A directory immediately under `sql_dir` whose name matches
/// `^\d{3}_.+` ("stage directory").
fn is_stage_directory(name: &str) -> bool {
    let bytes = name.as_bytes();
    bytes.len() > 4
        && bytes[0].is_ascii_digit()
        && bytes[1].is_ascii_digit()
        && bytes[2].is_ascii_digit()
        && bytes[3] == b'_'
}

impl MigrationCompiler {
    pub fn new(config: CompilerConfig, sink: SharedSink) -> Self {
        Self { config, sink }
    }

    /// Compiles using the current wall-clock time for the output
    /// filename.
    pub fn compile_now(&self) -> Result<CompiledArtifact, DeployError> {
        self.compile(Utc::now())
    }

    /// Compiles with an externalized timestamp so that two invocations
    /// with identical input and identical `timestamp` are byte-identical.
    pub fn compile(&self, timestamp: DateTime<Utc>) -> Result<CompiledArtifact, DeployError> {
        self.sink.emit(DeployEvent::Start {
            component: COMPONENT.to_string(),
            message: format!("compiling {}", self.config.sql_dir.display()),
        });

        let mut stage_dirs = self.list_stage_directories()?;
        stage_dirs.sort();

        let mut buffer = String::new();
        buffer.push_str(&self.header_banner(timestamp));

        let mut files_processed = 0usize;
        let mut directories = Vec::new();

        if stage_dirs.is_empty() {
            self.sink.emit(DeployEvent::Warning {
                component: COMPONENT.to_string(),
                message: "no stage-numbered directories found; falling back to flat root"
                    .to_string(),
            });
            let mut files = self.list_sql_files_direct(&self.config.sql_dir)?;
            files.sort();
            for file in &files {
                self.append_file(&mut buffer, file)?;
                files_processed += 1;
            }
        } else {
            for stage_dir in &stage_dirs {
                let dir_name = stage_dir
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                self.sink.emit(DeployEvent::Progress {
                    component: COMPONENT.to_string(),
                    message: format!("directory:start {dir_name}"),
                });

                let mut files = self.list_sql_files_recursive(stage_dir)?;
                files.sort();

                if files.is_empty() {
                    self.sink.emit(DeployEvent::Progress {
                        component: COMPONENT.to_string(),
                        message: format!("directory:skip {dir_name} (no .sql files)"),
                    });
                    continue;
                }

                buffer.push_str(&format!("-- ==== Directory: {dir_name} ====\n\n"));
                for file in &files {
                    self.append_file(&mut buffer, file)?;
                    files_processed += 1;
                }
                directories.push(dir_name.clone());
                self.sink.emit(DeployEvent::Progress {
                    component: COMPONENT.to_string(),
                    message: format!("directory:complete {dir_name}"),
                });
            }
        }

        let lines_written = buffer.lines().count();
        buffer.push_str(&self.footer_banner(files_processed, lines_written, &directories));

        let filename = format!("{}_compiled.sql", timestamp.format("%Y%m%d%H%M%S"));
        let output_path = self.config.output_dir.join(filename);
        std::fs::create_dir_all(&self.config.output_dir)?;
        std::fs::write(&output_path, &buffer)?;

        self.sink.emit(DeployEvent::Success {
            component: COMPONENT.to_string(),
            message: format!("wrote {} ({files_processed} files)", output_path.display()),
        });

        Ok(CompiledArtifact {
            output_path,
            contents: buffer,
            files_processed,
            lines_written,
            directories,
        })
    }

    fn header_banner(&self, timestamp: DateTime<Utc>) -> String {
        format!(
            "-- ============================================================\n\
             -- Compiled migration\n\
             -- Generated: {}\n\
             -- Source: {}\n\
             -- ============================================================\n\n",
            timestamp.to_rfc3339(),
            self.config.sql_dir.display()
        )
    }

    fn footer_banner(&self, files: usize, lines: usize, directories: &[String]) -> String {
        format!(
            "-- ============================================================\n\
             -- filesProcessed: {files}\n\
             -- linesWritten: {lines}\n\
             -- directories: [{}]\n\
             -- ============================================================\n",
            directories.join(", ")
        )
    }

    fn append_file(&self, buffer: &mut String, path: &Path) -> Result<(), DeployError> {
        self.sink.emit(DeployEvent::Progress {
            component: COMPONENT.to_string(),
            message: format!("file:process {}", path.display()),
        });
        let content = std::fs::read_to_string(path).map_err(|e| {
            self.sink.emit(DeployEvent::Error {
                component: COMPONENT.to_string(),
                message: format!("file:error {}: {e}", path.display()),
            });
            DeployError::Io(e)
        })?;
        buffer.push_str(&format!("-- File: {}\n", path.display()));
        buffer.push_str(&content);
        if !content.ends_with('\n') {
            buffer.push('\n');
        }
        buffer.push('\n');
        self.sink.emit(DeployEvent::Progress {
            component: COMPONENT.to_string(),
            message: format!("file:complete {}", path.display()),
        });
        Ok(())
    }

    fn list_stage_directories(&self) -> Result<Vec<PathBuf>, DeployError> {
        if !self.config.sql_dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut dirs = Vec::new();
        for entry in std::fs::read_dir(&self.config.sql_dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if is_stage_directory(&name) {
                dirs.push(path);
            }
        }
        Ok(dirs)
    }

    fn list_sql_files_direct(&self, dir: &Path) -> Result<Vec<PathBuf>, DeployError> {
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "sql") {
                files.push(path);
            }
        }
        Ok(files)
    }

    fn list_sql_files_recursive(&self, dir: &Path) -> Result<Vec<PathBuf>, DeployError> {
        let mut files = Vec::new();
        self.collect_sql_files(dir, &mut files)?;
        Ok(files)
    }

    fn collect_sql_files(&self, dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), DeployError> {
        let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .collect();
        entries.sort();
        for path in entries {
            if path.is_dir() {
                self.collect_sql_files(&path, out)?;
            } else if path.extension().is_some_and(|ext| ext == "sql") {
                out.push(path);
            }
        }
        Ok(())
    }
}
