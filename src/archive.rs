use crate::{TraceMetadata, ensure_dir, sha256_file, trace_metadata_path};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeSet,
    ffi::OsString,
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};
use thiserror::Error;

pub const TRACE_SUFFIX: &str = "zstf";
pub const METADATA_SUFFIX: &str = "zstf.metadata.yaml";

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("No traces provided")]
    NoTraces,
    #[error("Metadata file not found for trace {0}")]
    MetadataNotFound(PathBuf),
    #[error("Traces from different workloads provided ({0} and {1})")]
    DifferentWorkloads(String, String),
    #[error("Multiple traces provided and at least one of them is fully traced")]
    MultipleFullyTraced,
    #[error("Workload {0} is not in the archive, provide the workload binary")]
    WorkloadRequired(String),
    #[error("Workload file SHA256 {actual} does not match the metadata ({expected})")]
    WorkloadShaMismatch { expected: String, actual: String },
    #[error("Trace attempt {attempt} does not exist for workload {workload_id}")]
    AttemptNotFound { workload_id: u32, attempt: u32 },
    #[error("Trace attempt {attempt} of workload {workload_id} is fully traced")]
    AttemptFullyTraced { workload_id: u32, attempt: u32 },
    #[error("{given} part numbers given for {traces} traces")]
    PartCountMismatch { given: usize, traces: usize },
    #[error("Part number {0} already used")]
    DuplicatePart(u32),
    #[error("Trace {0} already exists in the archive")]
    AlreadyExists(String),
    #[error("Trace {0} not found")]
    TraceNotFound(String),
    #[error("Workload {0} not found")]
    WorkloadNotFound(u32),
    #[error("Invalid trace id '{0}'")]
    InvalidTraceId(String),
    #[error("Multiple workload files in {0}")]
    MultipleWorkloadFiles(PathBuf),
    #[error("Storage '{0}' not found")]
    StorageNotFound(String),
    #[error("Storage '{0}' already configured")]
    DuplicateStorage(String),
    #[error("No storage configured")]
    NoStorage,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type ArchiveResult<T> = Result<T, ArchiveError>;

/// `<workload_id>.<attempt>.<part:04>_<workload_name>`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TraceId {
    pub workload_id: u32,
    pub attempt: u32,
    pub part: u32,
    pub workload_name: String,
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{:04}_{}",
            self.workload_id, self.attempt, self.part, self.workload_name
        )
    }
}

impl FromStr for TraceId {
    type Err = ArchiveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ArchiveError::InvalidTraceId(s.to_string());
        let (numbers, workload_name) = s.split_once('_').ok_or_else(invalid)?;
        let mut numbers = numbers.split('.').map(|n| n.parse::<u32>());
        match (numbers.next(), numbers.next(), numbers.next(), numbers.next()) {
            (Some(Ok(workload_id)), Some(Ok(attempt)), Some(Ok(part)), None)
                if !workload_name.is_empty() =>
            {
                Ok(TraceId {
                    workload_id,
                    attempt,
                    part,
                    workload_name: workload_name.to_string(),
                })
            }
            _ => Err(invalid()),
        }
    }
}

pub fn workload_folder(workload_id: u32, workload_name: &str) -> String {
    format!("{:04}_{}", workload_id, workload_name)
}

pub fn attempt_folder(attempt: u32) -> String {
    format!("attempt_{:04}", attempt)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadRow {
    pub workload_id: u32,
    pub workload_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceRow {
    pub trace_id: String,
    pub attempt: u32,
    pub part: u32,
    pub workload_id: u32,
    pub workload_sha: String,
    pub workload_name: String,
    pub fully_traced: bool,
}

/// In-memory tables rebuilt from storage on every refresh
#[derive(Debug, Clone, Default)]
pub struct ArchiveIndex {
    pub workloads: Vec<WorkloadRow>,
    pub traces: Vec<TraceRow>,
}

impl ArchiveIndex {
    pub fn workload(&self, workload_id: u32) -> Option<&WorkloadRow> {
        self.workloads
            .iter()
            .find(|row| row.workload_id == workload_id)
    }

    pub fn workload_by_sha(&self, sha256: &str) -> Option<u32> {
        self.traces
            .iter()
            .find(|row| row.workload_sha == sha256)
            .map(|row| row.workload_id)
    }

    pub fn next_workload_id(&self) -> u32 {
        self.workloads
            .iter()
            .map(|row| row.workload_id + 1)
            .max()
            .unwrap_or(0)
    }

    pub fn attempts(&self, workload_id: u32) -> BTreeSet<u32> {
        self.traces
            .iter()
            .filter(|row| row.workload_id == workload_id)
            .map(|row| row.attempt)
            .collect()
    }

    pub fn next_attempt(&self, workload_id: u32) -> u32 {
        self.attempts(workload_id)
            .last()
            .map(|attempt| attempt + 1)
            .unwrap_or(0)
    }

    pub fn parts(&self, workload_id: u32, attempt: u32) -> BTreeSet<u32> {
        self.traces
            .iter()
            .filter(|row| row.workload_id == workload_id && row.attempt == attempt)
            .map(|row| row.part)
            .collect()
    }

    pub fn is_fully_traced(&self, workload_id: u32, attempt: u32) -> bool {
        self.traces
            .iter()
            .any(|row| row.workload_id == workload_id && row.attempt == attempt && row.fully_traced)
    }

    pub fn contains_trace(&self, trace_id: &str) -> bool {
        self.traces.iter().any(|row| row.trace_id == trace_id)
    }
}

/// Storage backend of the trace archive
pub trait Repository {
    /// Rebuild the index from the backing store
    fn refresh(&mut self) -> ArchiveResult<()>;
    fn index(&self) -> &ArchiveIndex;
    /// Store a workload binary under a new id
    fn insert_workload(&mut self, workload_id: u32, source: &Path) -> ArchiveResult<WorkloadRow>;
    /// Store a trace and its metadata; the metadata must carry the trace id
    fn insert_trace(&mut self, source: &Path, metadata: &TraceMetadata) -> ArchiveResult<TraceRow>;
    fn metadata(&self, trace_id: &str) -> ArchiveResult<TraceMetadata>;
    fn trace_file(&self, trace_id: &str) -> ArchiveResult<PathBuf>;
    fn workload_file(&self, workload_id: u32) -> ArchiveResult<PathBuf>;
}

/// Archive kept in a plain directory tree:
/// `<root>/<id:04>_<name>/attempt_<n:04>/<trace_id>.zstf[.metadata.yaml]`
pub struct LocalStorage {
    root: PathBuf,
    index: ArchiveIndex,
}

impl LocalStorage {
    pub fn open<P: AsRef<Path>>(root: P) -> ArchiveResult<Self> {
        let root = root.as_ref();
        if root.as_os_str().is_empty() {
            return Err(anyhow::anyhow!("Storage path cannot be empty").into());
        }
        let mut storage = Self {
            root: root.to_path_buf(),
            index: ArchiveIndex::default(),
        };
        storage.refresh()?;
        Ok(storage)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn attempt_dir(&self, trace_id: &TraceId) -> PathBuf {
        self.root
            .join(workload_folder(trace_id.workload_id, &trace_id.workload_name))
            .join(attempt_folder(trace_id.attempt))
    }

    fn stored_paths(&self, trace_id: &str) -> ArchiveResult<(PathBuf, PathBuf)> {
        let parsed: TraceId = trace_id.parse()?;
        let dir = self.attempt_dir(&parsed);
        Ok((
            dir.join(format!("{}.{}", trace_id, TRACE_SUFFIX)),
            dir.join(format!("{}.{}", trace_id, METADATA_SUFFIX)),
        ))
    }

    fn scan_attempt(&self, workload: &WorkloadRow, dir: &Path, rows: &mut Vec<TraceRow>) -> ArchiveResult<()> {
        let suffix = format!(".{}", METADATA_SUFFIX);
        let mut names = vec![];
        for entry in std::fs::read_dir(dir)? {
            let name = entry?.file_name().to_string_lossy().to_string();
            if let Some(trace_id) = name.strip_suffix(&suffix) {
                names.push(trace_id.to_string());
            }
        }
        names.sort();
        for trace_id in names {
            let parsed: TraceId = match trace_id.parse() {
                Ok(parsed) => parsed,
                Err(_) => {
                    warn!("Ignoring unexpected file {} in {}", trace_id, dir.display());
                    continue;
                }
            };
            let metadata = match TraceMetadata::from_path(dir.join(format!("{}{}", trace_id, suffix))) {
                Ok(metadata) => metadata,
                Err(err) => {
                    warn!("Skipping trace {}: {:#}", trace_id, err);
                    continue;
                }
            };
            rows.push(TraceRow {
                trace_id,
                attempt: parsed.attempt,
                part: parsed.part,
                workload_id: workload.workload_id,
                workload_sha: metadata.workload.sha256.clone(),
                workload_name: workload.workload_name.clone(),
                fully_traced: metadata.is_fully_traced(),
            });
        }
        Ok(())
    }
}

impl Repository for LocalStorage {
    fn refresh(&mut self) -> ArchiveResult<()> {
        ensure_dir(&self.root)?;
        let mut index = ArchiveIndex::default();
        let mut folders = vec![];
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                folders.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        folders.sort();

        for folder in folders {
            let Some((id, name)) = folder.split_once('_') else {
                debug!("Skipping {}", folder);
                continue;
            };
            let Ok(workload_id) = id.parse::<u32>() else {
                debug!("Skipping {}", folder);
                continue;
            };
            let workload = WorkloadRow {
                workload_id,
                workload_name: name.to_string(),
            };
            for entry in std::fs::read_dir(self.root.join(&folder))? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().to_string();
                if entry.file_type()?.is_dir() && name.starts_with("attempt_") {
                    self.scan_attempt(&workload, &entry.path(), &mut index.traces)?;
                }
            }
            index.workloads.push(workload);
        }
        index.traces.sort_by(|a, b| a.trace_id.cmp(&b.trace_id));
        self.index = index;
        Ok(())
    }

    fn index(&self) -> &ArchiveIndex {
        &self.index
    }

    fn insert_workload(&mut self, workload_id: u32, source: &Path) -> ArchiveResult<WorkloadRow> {
        let Some(workload_name) = source.file_name().map(|name| name.to_string_lossy().to_string())
        else {
            return Err(anyhow::anyhow!("Invalid workload path {}", source.display()).into());
        };
        let dir = self.root.join(workload_folder(workload_id, &workload_name));
        std::fs::create_dir(&dir)?;
        std::fs::copy(source, dir.join(&workload_name))?;
        info!("Stored workload {} as id {}", workload_name, workload_id);

        let row = WorkloadRow {
            workload_id,
            workload_name,
        };
        self.index.workloads.push(row.clone());
        Ok(row)
    }

    fn insert_trace(&mut self, source: &Path, metadata: &TraceMetadata) -> ArchiveResult<TraceRow> {
        let Some(trace_id) = metadata.trace_id.clone() else {
            return Err(anyhow::anyhow!("Trace id is required to insert a trace").into());
        };
        let parsed: TraceId = trace_id.parse()?;
        let (trace_path, metadata_path) = self.stored_paths(&trace_id)?;
        if trace_path.exists() || metadata_path.exists() {
            return Err(ArchiveError::AlreadyExists(trace_id));
        }
        ensure_dir(self.attempt_dir(&parsed))?;
        std::fs::copy(source, &trace_path)?;
        std::fs::write(&metadata_path, metadata.to_yaml()?)?;
        info!("Stored trace {}", trace_id);

        let row = TraceRow {
            trace_id,
            attempt: parsed.attempt,
            part: parsed.part,
            workload_id: parsed.workload_id,
            workload_sha: metadata.workload.sha256.clone(),
            workload_name: parsed.workload_name,
            fully_traced: metadata.is_fully_traced(),
        };
        self.index.traces.push(row.clone());
        Ok(row)
    }

    fn metadata(&self, trace_id: &str) -> ArchiveResult<TraceMetadata> {
        let (_, metadata_path) = self.stored_paths(trace_id)?;
        if !metadata_path.is_file() {
            return Err(ArchiveError::TraceNotFound(trace_id.to_string()));
        }
        Ok(TraceMetadata::from_path(metadata_path)?)
    }

    fn trace_file(&self, trace_id: &str) -> ArchiveResult<PathBuf> {
        let (trace_path, _) = self.stored_paths(trace_id)?;
        if !trace_path.is_file() {
            return Err(ArchiveError::TraceNotFound(trace_id.to_string()));
        }
        Ok(trace_path)
    }

    fn workload_file(&self, workload_id: u32) -> ArchiveResult<PathBuf> {
        let row = self
            .index
            .workload(workload_id)
            .ok_or(ArchiveError::WorkloadNotFound(workload_id))?;
        let dir = self.root.join(workload_folder(workload_id, &row.workload_name));
        let mut found = None;
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if found.is_some() {
                return Err(ArchiveError::MultipleWorkloadFiles(dir));
            }
            found = Some(entry.path());
        }
        found.ok_or(ArchiveError::WorkloadNotFound(workload_id))
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Metadata of a trace about to be uploaded: `<trace>.metadata.yaml`, else the generator's JSON sidecar
pub fn source_metadata_path(trace: &Path) -> ArchiveResult<PathBuf> {
    let yaml = with_suffix(trace, ".metadata.yaml");
    if yaml.is_file() {
        return Ok(yaml);
    }
    let json = trace_metadata_path(trace);
    if json.is_file() {
        return Ok(json);
    }
    Err(ArchiveError::MetadataNotFound(trace.to_path_buf()))
}

#[derive(Debug, Clone, Default)]
pub struct UploadRequest {
    pub traces: Vec<PathBuf>,
    /// workload binary, needed when the workload is not archived yet
    pub workload: Option<PathBuf>,
    /// existing attempt to add partial traces to
    pub attempt: Option<u32>,
    /// part numbers, paired with `traces` in order
    pub parts: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkloadPlan {
    Existing(WorkloadRow),
    New { row: WorkloadRow, source: PathBuf },
}

impl WorkloadPlan {
    pub fn row(&self) -> &WorkloadRow {
        match self {
            WorkloadPlan::Existing(row) => row,
            WorkloadPlan::New { row, .. } => row,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlannedTrace {
    pub source: PathBuf,
    pub trace_id: TraceId,
    pub metadata: TraceMetadata,
}

/// Everything an upload will write, computed before touching storage
#[derive(Debug, Clone)]
pub struct UploadPlan {
    pub workload: WorkloadPlan,
    pub attempt: u32,
    pub traces: Vec<PlannedTrace>,
}

pub struct TraceArchive<R: Repository> {
    repository: R,
}

impl<R: Repository> TraceArchive<R> {
    pub fn new(repository: R) -> Self {
        Self { repository }
    }

    pub fn repository(&self) -> &R {
        &self.repository
    }

    fn resolve_workload(&self, sha256: &str, request: &UploadRequest) -> ArchiveResult<WorkloadPlan> {
        let index = self.repository.index();
        if let Some(workload_id) = index.workload_by_sha(sha256) {
            if let Some(row) = index.workload(workload_id) {
                info!("Workload already archived as {}", workload_id);
                return Ok(WorkloadPlan::Existing(row.clone()));
            }
        }
        // archived binaries without any trace yet
        for row in &index.workloads {
            if !index.attempts(row.workload_id).is_empty() {
                continue;
            }
            let file = self.repository.workload_file(row.workload_id)?;
            if sha256_file(&file)? == sha256 {
                return Ok(WorkloadPlan::Existing(row.clone()));
            }
        }

        let Some(source) = &request.workload else {
            return Err(ArchiveError::WorkloadRequired(sha256.to_string()));
        };
        let actual = sha256_file(source)?;
        if actual != sha256 {
            return Err(ArchiveError::WorkloadShaMismatch {
                expected: sha256.to_string(),
                actual,
            });
        }
        let Some(workload_name) = source.file_name().map(|name| name.to_string_lossy().to_string())
        else {
            return Err(anyhow::anyhow!("Invalid workload path {}", source.display()).into());
        };
        Ok(WorkloadPlan::New {
            row: WorkloadRow {
                workload_id: index.next_workload_id(),
                workload_name,
            },
            source: source.clone(),
        })
    }

    /// Validate an upload against the archive without modifying it
    pub fn plan_upload(&mut self, request: &UploadRequest) -> ArchiveResult<UploadPlan> {
        self.repository.refresh()?;
        if request.traces.is_empty() {
            return Err(ArchiveError::NoTraces);
        }
        if !request.parts.is_empty() && request.parts.len() != request.traces.len() {
            return Err(ArchiveError::PartCountMismatch {
                given: request.parts.len(),
                traces: request.traces.len(),
            });
        }

        let mut sources = vec![];
        for trace in &request.traces {
            let metadata = TraceMetadata::from_path(source_metadata_path(trace)?)?;
            sources.push((trace.clone(), metadata));
        }

        let sha256 = sources[0].1.workload.sha256.clone();
        for (_, metadata) in &sources {
            if metadata.workload.sha256 != sha256 {
                return Err(ArchiveError::DifferentWorkloads(
                    sha256,
                    metadata.workload.sha256.clone(),
                ));
            }
        }
        let fully_traced = sources.iter().any(|(_, metadata)| metadata.is_fully_traced());
        if fully_traced && sources.len() > 1 {
            return Err(ArchiveError::MultipleFullyTraced);
        }

        let workload = self.resolve_workload(&sha256, request)?;
        let workload_id = workload.row().workload_id;
        let index = self.repository.index();

        let attempt = match request.attempt {
            Some(attempt) if fully_traced => {
                warn!("Ignoring attempt {}: a full trace always opens a new attempt", attempt);
                index.next_attempt(workload_id)
            }
            Some(attempt) => {
                if !index.attempts(workload_id).contains(&attempt) {
                    return Err(ArchiveError::AttemptNotFound {
                        workload_id,
                        attempt,
                    });
                }
                if index.is_fully_traced(workload_id, attempt) {
                    return Err(ArchiveError::AttemptFullyTraced {
                        workload_id,
                        attempt,
                    });
                }
                attempt
            }
            None => index.next_attempt(workload_id),
        };

        let make_id = |part: u32| TraceId {
            workload_id,
            attempt,
            part,
            workload_name: workload.row().workload_name.clone(),
        };
        let archived = index.parts(workload_id, attempt);
        let mut numbered: Vec<(u32, PathBuf, TraceMetadata)> = vec![];
        if fully_traced {
            let (source, metadata) = sources.remove(0);
            numbered.push((0, source, metadata));
        } else if !request.parts.is_empty() {
            let mut batch = BTreeSet::new();
            for (&part, (source, metadata)) in request.parts.iter().zip(sources) {
                if archived.contains(&part) {
                    return Err(ArchiveError::AlreadyExists(make_id(part).to_string()));
                }
                if !batch.insert(part) {
                    return Err(ArchiveError::DuplicatePart(part));
                }
                numbered.push((part, source, metadata));
            }
        } else {
            sources.sort_by_key(|(_, metadata)| metadata.start_instruction().unwrap_or(0));
            let mut next = archived.last().map(|part| part + 1).unwrap_or(0);
            for (source, metadata) in sources {
                numbered.push((next, source, metadata));
                next += 1;
            }
        }
        numbered.sort_by_key(|(part, _, _)| *part);

        let mut traces = vec![];
        for (part, source, mut metadata) in numbered {
            let trace_id = make_id(part);
            let id = trace_id.to_string();
            if index.contains_trace(&id) {
                return Err(ArchiveError::AlreadyExists(id));
            }
            metadata.trace_id = Some(id);
            metadata.workload.filename = workload.row().workload_name.clone();
            traces.push(PlannedTrace {
                source,
                trace_id,
                metadata,
            });
        }

        Ok(UploadPlan {
            workload,
            attempt,
            traces,
        })
    }

    /// Write a validated plan
    pub fn commit(&mut self, plan: &UploadPlan) -> ArchiveResult<Vec<String>> {
        if let WorkloadPlan::New { row, source } = &plan.workload {
            info!("Uploading workload {} with id {}", source.display(), row.workload_id);
            self.repository.insert_workload(row.workload_id, source)?;
        }
        let mut ids = vec![];
        for trace in &plan.traces {
            info!("Uploading trace {} as {}", trace.source.display(), trace.trace_id);
            let row = self.repository.insert_trace(&trace.source, &trace.metadata)?;
            ids.push(row.trace_id);
        }
        Ok(ids)
    }

    pub fn upload(&mut self, request: &UploadRequest) -> ArchiveResult<Vec<String>> {
        let plan = self.plan_upload(request)?;
        self.commit(&plan)
    }

    /// Trace rows with their metadata, ordered by trace id
    pub fn list(&self) -> ArchiveResult<Vec<(TraceRow, TraceMetadata, u64)>> {
        let mut rows = vec![];
        for row in &self.repository.index().traces {
            let metadata = self.repository.metadata(&row.trace_id)?;
            let size = std::fs::metadata(self.repository.trace_file(&row.trace_id)?)?.len();
            rows.push((row.clone(), metadata, size));
        }
        Ok(rows)
    }

    /// Copy a trace and its metadata out of the archive
    pub fn save_trace(&self, trace_id: &str, output: Option<&Path>) -> ArchiveResult<(PathBuf, PathBuf)> {
        let source = self.repository.trace_file(trace_id)?;
        let destination = output_path(output, &format!("{}.{}", trace_id, TRACE_SUFFIX))?;
        std::fs::copy(&source, &destination)?;
        let metadata_destination = with_suffix(&destination, ".metadata.yaml");
        self.write_metadata(trace_id, &metadata_destination)?;
        Ok((destination, metadata_destination))
    }

    pub fn save_metadata(&self, trace_id: &str, output: Option<&Path>) -> ArchiveResult<PathBuf> {
        let destination = output_path(output, &format!("{}.{}", trace_id, METADATA_SUFFIX))?;
        self.write_metadata(trace_id, &destination)?;
        Ok(destination)
    }

    fn write_metadata(&self, trace_id: &str, destination: &Path) -> ArchiveResult<()> {
        let metadata = self.repository.metadata(trace_id)?;
        std::fs::write(destination, metadata.to_yaml()?)?;
        Ok(())
    }

    pub fn save_workload(&self, workload_id: u32, output: Option<&Path>) -> ArchiveResult<PathBuf> {
        let source = self.repository.workload_file(workload_id)?;
        let default_name = source
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| format!("workload_{}", workload_id));
        let destination = output_path(output, &default_name)?;
        std::fs::copy(&source, &destination)?;
        Ok(destination)
    }
}

/// An existing directory receives the default file name; anything else is the file path
fn output_path(output: Option<&Path>, default_name: &str) -> ArchiveResult<PathBuf> {
    let path = match output {
        None => PathBuf::from(default_name),
        Some(dir) if dir.is_dir() => dir.join(default_name),
        Some(file) => {
            if let Some(parent) = file.parent().filter(|parent| !parent.as_os_str().is_empty()) {
                ensure_dir(parent)?;
            }
            file.to_path_buf()
        }
    };
    Ok(path)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalStorageConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StorageConfig {
    #[serde(rename = "local-storage")]
    Local {
        name: String,
        config: LocalStorageConfig,
    },
}

impl StorageConfig {
    pub fn name(&self) -> &str {
        match self {
            StorageConfig::Local { name, .. } => name,
        }
    }

    pub fn open(&self) -> ArchiveResult<LocalStorage> {
        match self {
            StorageConfig::Local { config, .. } => LocalStorage::open(&config.path),
        }
    }
}

/// Configured storages of `trace_share`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveConfig {
    #[serde(default)]
    pub storages: Vec<StorageConfig>,
    #[serde(default)]
    pub default_storage: Option<String>,
}

impl ArchiveConfig {
    /// A missing file is an empty configuration
    pub fn load<P: AsRef<Path>>(path: P) -> ArchiveResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&text)?)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> ArchiveResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            ensure_dir(parent)?;
        }
        std::fs::write(path, serde_yaml::to_string(self)?)?;
        Ok(())
    }

    /// The first storage added becomes the default
    pub fn add_local_storage(&mut self, name: &str, path: &Path) -> ArchiveResult<()> {
        if self.storages.iter().any(|storage| storage.name() == name) {
            return Err(ArchiveError::DuplicateStorage(name.to_string()));
        }
        let path = std::path::absolute(path)?;
        self.storages.push(StorageConfig::Local {
            name: name.to_string(),
            config: LocalStorageConfig { path },
        });
        if self.default_storage.is_none() {
            self.default_storage = Some(name.to_string());
        }
        Ok(())
    }

    pub fn set_default(&mut self, name: &str) -> ArchiveResult<()> {
        if !self.storages.iter().any(|storage| storage.name() == name) {
            return Err(ArchiveError::StorageNotFound(name.to_string()));
        }
        self.default_storage = Some(name.to_string());
        Ok(())
    }

    /// Named storage, or the default one
    pub fn select(&self, name: Option<&str>) -> ArchiveResult<&StorageConfig> {
        let Some(name) = name.or(self.default_storage.as_deref()) else {
            return Err(ArchiveError::NoStorage);
        };
        self.storages
            .iter()
            .find(|storage| storage.name() == name)
            .ok_or_else(|| ArchiveError::StorageNotFound(name.to_string()))
    }
}
