use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::error::DagError;

/// Nombre de la etapa final de empaquetado.
pub const PACKAGE_STAGE: &str = "package";

/// Nombre del único artefacto que deja la etapa de empaquetado.
pub const PACKAGE_ARTIFACT: &str = "model_package.zip";

/// Variables climáticas con cadena punto -> grilla.
pub const CLIMATE_VARIABLES: [&str; 4] = ["temperature", "precipitation", "vapor_pressure", "wind"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dag {
    pub nodes: Vec<StageNode>,
    pub edges: Vec<(String, String)>, // (from, to): "to" depende de "from"
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageNode {
    pub id: String,

    /// Archivos (relativos al área intermedia) que tienen que existir antes
    /// de invocar la etapa.
    #[serde(default)]
    pub requires: Vec<String>,

    /// Archivos que la etapa deja en el área intermedia.
    #[serde(default)]
    pub produces: Vec<String>,
}

impl StageNode {
    pub fn new(id: &str, requires: &[&str], produces: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            requires: requires.iter().map(|s| s.to_string()).collect(),
            produces: produces.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl Dag {
    pub fn node(&self, id: &str) -> Option<&StageNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn dependencies_of(&self, id: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|(_, to)| to == id)
            .map(|(from, _)| from.as_str())
            .collect()
    }

    pub fn dependents_of(&self, id: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|(from, _)| from == id)
            .map(|(_, to)| to.as_str())
            .collect()
    }

    /// Todos los archivos que producen las etapas del grafo.
    pub fn all_products(&self) -> Vec<String> {
        self.nodes
            .iter()
            .flat_map(|n| n.produces.iter().cloned())
            .collect()
    }

    pub fn validate(&self) -> Result<(), DagError> {
        self.topological_order().map(|_| ())
    }

    /// Orden topológico (Kahn). Entre las etapas listas se respeta el orden
    /// de declaración, así el orden serial es determinista.
    pub fn topological_order(&self) -> Result<Vec<&StageNode>, DagError> {
        let mut seen = HashSet::new();
        for n in &self.nodes {
            if !seen.insert(n.id.as_str()) {
                return Err(DagError::DuplicateStage(n.id.clone()));
            }
        }

        let mut pending_deps: HashMap<&str, usize> =
            self.nodes.iter().map(|n| (n.id.as_str(), 0)).collect();
        for (from, to) in &self.edges {
            for end in [from, to] {
                if !seen.contains(end.as_str()) {
                    let stage = if end == to { from } else { to };
                    return Err(DagError::UnknownDependency {
                        stage: stage.clone(),
                        dependency: end.clone(),
                    });
                }
            }
            if let Some(count) = pending_deps.get_mut(to.as_str()) {
                *count += 1;
            }
        }

        let mut order: Vec<&StageNode> = Vec::with_capacity(self.nodes.len());
        let mut done: HashSet<&str> = HashSet::new();

        while order.len() < self.nodes.len() {
            let next = self
                .nodes
                .iter()
                .find(|n| !done.contains(n.id.as_str()) && pending_deps[n.id.as_str()] == 0);

            let Some(node) = next else {
                let stuck = self
                    .nodes
                    .iter()
                    .filter(|n| !done.contains(n.id.as_str()))
                    .map(|n| n.id.clone())
                    .collect();
                return Err(DagError::Cycle(stuck));
            };

            done.insert(node.id.as_str());
            for dependent in self.dependents_of(&node.id) {
                if let Some(count) = pending_deps.get_mut(dependent) {
                    *count -= 1;
                }
            }
            order.push(node);
        }

        Ok(order)
    }
}

/// Etapa de empaquetado: necesita todo lo que produjo el resto del grafo.
pub fn package_stage(dag: &Dag) -> StageNode {
    StageNode {
        id: PACKAGE_STAGE.to_string(),
        requires: dag.all_products(),
        produces: vec![PACKAGE_ARTIFACT.to_string()],
    }
}

/// Grafo fijo del paquete de cuenca:
///
/// dem -> {slope, aspect, latlon, landcover, pressure}
/// dem -> <var>_point -> <var>_grid   (temperature, precipitation, vapor_pressure, wind)
/// {temperature_grid, vapor_pressure_grid} -> rh_point -> rh_grid
pub fn watershed_package_dag() -> Dag {
    let mut nodes = vec![StageNode::new("dem", &[], &["dem.tif"])];
    let mut edges: Vec<(String, String)> = Vec::new();

    let mut edge = |from: &str, to: &str| edges.push((from.to_string(), to.to_string()));

    for (id, out) in [
        ("slope", "slope.tif"),
        ("aspect", "aspect.tif"),
        ("latlon", "latlon.nc"),
        ("landcover", "landcover.tif"),
        ("pressure", "pressure.nc"),
    ] {
        nodes.push(StageNode::new(id, &["dem.tif"], &[out]));
        edge("dem", id);
    }

    for var in CLIMATE_VARIABLES {
        let point = format!("{}_point", var);
        let grid = format!("{}_grid", var);
        let point_file = format!("{}_point.nc", var);
        let grid_file = format!("{}.nc", var);

        nodes.push(StageNode::new(&point, &["dem.tif"], &[&point_file]));
        nodes.push(StageNode::new(&grid, &[&point_file], &[&grid_file]));
        edge("dem", &point);
        edge(&point, &grid);
    }

    nodes.push(StageNode::new(
        "rh_point",
        &["temperature.nc", "vapor_pressure.nc"],
        &["rh_point.nc"],
    ));
    nodes.push(StageNode::new("rh_grid", &["rh_point.nc"], &["rh.nc"]));
    edge("temperature_grid", "rh_point");
    edge("vapor_pressure_grid", "rh_point");
    edge("rh_point", "rh_grid");

    Dag { nodes, edges }
}
