use std::io;
use std::path::{Path, PathBuf};

/// Directorio de trabajo de un job: productos intermedios y paquete final.
/// Lo usa en exclusiva la corrida de ese job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobWorkspace {
    pub root: PathBuf,
    pub intermediate: PathBuf,
    pub package: PathBuf,
}

impl JobWorkspace {
    pub fn for_job(data_dir: &Path, job_id: &str) -> Self {
        let root = data_dir.join(job_id);
        Self {
            intermediate: root.join("intermediate"),
            package: root.join("package"),
            root,
        }
    }

    pub async fn prepare(&self) -> io::Result<()> {
        tokio::fs::create_dir_all(&self.intermediate).await?;
        tokio::fs::create_dir_all(&self.package).await?;
        Ok(())
    }

    /// Borra el directorio completo del job. Que no exista no es error.
    pub async fn remove(&self) -> io::Result<()> {
        remove_dir_if_exists(&self.root).await
    }

    /// Borra sólo los productos intermedios (tras empaquetar).
    pub async fn clear_intermediate(&self) -> io::Result<()> {
        remove_dir_if_exists(&self.intermediate).await
    }

    /// Archivos del área de paquete, ordenados.
    pub fn package_files(&self) -> io::Result<Vec<PathBuf>> {
        let entries = match std::fs::read_dir(&self.package) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut files = Vec::new();
        for entry in entries.flatten() {
            if entry.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
                files.push(entry.path());
            }
        }
        files.sort();
        Ok(files)
    }
}

async fn remove_dir_if_exists(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
