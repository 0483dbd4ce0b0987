use parking_lot::Mutex;
use std::collections::HashMap;

use crate::results::StageResult;
use crate::task::{TaskHandle, TaskKey, TaskState};

/// Estado compartido de tareas: handles vivos, resultados terminales y la
/// relación padre -> hijos que se usa para limpiar en cascada.
///
/// Cada tabla tiene su propio lock. Cuando una operación necesita más de uno,
/// siempre se toman en el orden `children` -> `handles` -> `results`.
#[derive(Debug, Default)]
pub struct TaskStore {
    handles: Mutex<HashMap<TaskKey, TaskHandle>>,
    results: Mutex<HashMap<TaskKey, StageResult>>,
    children: Mutex<HashMap<TaskKey, Vec<TaskKey>>>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: &str, handle: TaskHandle) {
        self.handles.lock().insert(key.to_string(), handle);
    }

    pub fn get(&self, key: &str) -> Option<TaskHandle> {
        self.handles.lock().get(key).cloned()
    }

    /// Cambia el estado de un handle existente. Devuelve false si ya no está.
    pub fn set_state(&self, key: &str, state: TaskState) -> bool {
        match self.handles.lock().get_mut(key) {
            Some(handle) => {
                handle.state = state;
                true
            }
            None => false,
        }
    }

    /// Guarda un resultado suelto. El executor usa `finish`, que además mueve
    /// el handle a su estado terminal bajo los mismos locks.
    pub fn set_result(&self, key: &str, result: StageResult) {
        self.results.lock().insert(key.to_string(), result);
    }

    pub fn get_result(&self, key: &str) -> Option<StageResult> {
        self.results.lock().get(key).cloned()
    }

    /// Lleva el handle a un estado terminal y deja su resultado.
    /// Si el handle ya fue purgado no guarda nada y devuelve false.
    pub fn finish(&self, key: &str, state: TaskState, result: StageResult) -> bool {
        debug_assert!(state.is_terminal());
        let mut handles = self.handles.lock();
        let Some(handle) = handles.get_mut(key) else {
            return false;
        };
        let mut results = self.results.lock();
        results.insert(key.to_string(), result);
        handle.state = state;
        true
    }

    pub fn remove_handle(&self, key: &str) -> Option<TaskHandle> {
        self.handles.lock().remove(key)
    }

    pub fn remove_result(&self, key: &str) -> Option<StageResult> {
        self.results.lock().remove(key)
    }

    pub fn link_child(&self, parent: &str, child: &str) {
        let mut children = self.children.lock();
        let list = children.entry(parent.to_string()).or_default();
        if !list.iter().any(|c| c == child) {
            list.push(child.to_string());
        }
    }

    pub fn children_of(&self, parent: &str) -> Vec<TaskKey> {
        self.children
            .lock()
            .get(parent)
            .cloned()
            .unwrap_or_default()
    }

    /// Quita el handle del padre y el de cada hijo registrado, y vacía la
    /// lista de hijos. Los hijos no reciben aviso: desaparecer es terminal.
    /// Devuelve las claves hijas que estaban registradas.
    pub fn remove_with_children(&self, parent: &str) -> Vec<TaskKey> {
        let mut children = self.children.lock();
        let linked = children.remove(parent).unwrap_or_default();

        let mut handles = self.handles.lock();
        handles.remove(parent);
        for child in &linked {
            handles.remove(child);
        }

        linked
    }

    pub fn handle_count(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn result_count(&self) -> usize {
        self.results.lock().len()
    }
}
