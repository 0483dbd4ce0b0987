use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::JobStoreError;
use crate::job::{Job, JobId, RunStatus, ServiceKind};

/// Almacén persistente de registros de job.
pub trait JobStore: Send + Sync {
    fn insert(&self, job: Job) -> Result<(), JobStoreError>;

    fn get(&self, id: &str) -> Result<Option<Job>, JobStoreError>;

    /// Reemplaza el registro completo. Falla si el job no existe.
    fn update(&self, job: &Job) -> Result<(), JobStoreError>;

    fn remove(&self, id: &str) -> Result<Option<Job>, JobStoreError>;

    fn list(&self) -> Result<Vec<Job>, JobStoreError>;

    /// RunStatus=Processing AND ServiceKind=kind ORDER BY StartTime
    fn oldest_processing(&self, kind: &ServiceKind) -> Result<Option<Job>, JobStoreError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|j| j.run_status == RunStatus::Processing && &j.service_kind == kind)
            .min_by(|a, b| {
                let ka = (a.start_time.unwrap_or(a.call_time), &a.id);
                let kb = (b.start_time.unwrap_or(b.call_time), &b.id);
                ka.cmp(&kb)
            }))
    }

    /// RunStatus=InQueue AND ServiceKind=kind ORDER BY CallTime
    fn oldest_queued(&self, kind: &ServiceKind) -> Result<Option<Job>, JobStoreError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|j| j.run_status == RunStatus::InQueue && &j.service_kind == kind)
            .min_by(|a, b| (a.call_time, &a.id).cmp(&(b.call_time, &b.id))))
    }
}

#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<JobId, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobStore for MemoryJobStore {
    fn insert(&self, job: Job) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.lock();
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        jobs.insert(job.id.clone(), job);
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<Job>, JobStoreError> {
        Ok(self.jobs.lock().get(id).cloned())
    }

    fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        match self.jobs.lock().get_mut(&job.id) {
            Some(slot) => {
                *slot = job.clone();
                Ok(())
            }
            None => Err(JobStoreError::NotFound(job.id.clone())),
        }
    }

    fn remove(&self, id: &str) -> Result<Option<Job>, JobStoreError> {
        Ok(self.jobs.lock().remove(id))
    }

    fn list(&self) -> Result<Vec<Job>, JobStoreError> {
        let mut jobs: Vec<Job> = self.jobs.lock().values().cloned().collect();
        jobs.sort_by(|a, b| (a.call_time, &a.id).cmp(&(b.call_time, &b.id)));
        Ok(jobs)
    }
}

/// Registros en un archivo JSON. Se reescribe entero (tmp + rename) en cada
/// cambio, así un corte a mitad de escritura no deja el archivo roto.
#[derive(Debug)]
pub struct FileJobStore {
    path: PathBuf,
    jobs: Mutex<HashMap<JobId, Job>>,
}

impl FileJobStore {
    /// Abre el archivo si existe; si no, arranca vacío.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, JobStoreError> {
        let path = path.into();
        let jobs = match fs::read(&path) {
            Ok(bytes) if bytes.is_empty() => HashMap::new(),
            Ok(bytes) => {
                let list: Vec<Job> = serde_json::from_slice(&bytes)?;
                list.into_iter().map(|j| (j.id.clone(), j)).collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        info!("job store {} cargado con {} jobs", path.display(), jobs.len());
        Ok(Self {
            path,
            jobs: Mutex::new(jobs),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, jobs: &HashMap<JobId, Job>) -> Result<(), JobStoreError> {
        let mut list: Vec<&Job> = jobs.values().collect();
        list.sort_by(|a, b| (a.call_time, &a.id).cmp(&(b.call_time, &b.id)));

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&list)?)?;
        fs::rename(&tmp, &self.path)?;
        debug!("job store persistido ({} jobs)", list.len());
        Ok(())
    }
}

impl JobStore for FileJobStore {
    fn insert(&self, job: Job) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.lock();
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        let id = job.id.clone();
        jobs.insert(id.clone(), job);
        if let Err(e) = self.persist(&jobs) {
            jobs.remove(&id);
            return Err(e);
        }
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<Job>, JobStoreError> {
        Ok(self.jobs.lock().get(id).cloned())
    }

    fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.lock();
        let Some(slot) = jobs.get_mut(&job.id) else {
            return Err(JobStoreError::NotFound(job.id.clone()));
        };
        let previous = std::mem::replace(slot, job.clone());
        if let Err(e) = self.persist(&jobs) {
            jobs.insert(previous.id.clone(), previous);
            return Err(e);
        }
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<Option<Job>, JobStoreError> {
        let mut jobs = self.jobs.lock();
        let Some(removed) = jobs.remove(id) else {
            return Ok(None);
        };
        if let Err(e) = self.persist(&jobs) {
            jobs.insert(removed.id.clone(), removed);
            return Err(e);
        }
        Ok(Some(removed))
    }

    fn list(&self) -> Result<Vec<Job>, JobStoreError> {
        let mut jobs: Vec<Job> = self.jobs.lock().values().cloned().collect();
        jobs.sort_by(|a, b| (a.call_time, &a.id).cmp(&(b.call_time, &b.id)));
        Ok(jobs)
    }
}
