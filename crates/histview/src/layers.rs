//! Layers known to the command line: one per table map entry.

use std::collections::BTreeMap;
use std::sync::Arc;

use histview_core::services::host::{EditableLayer, LayerRegistry};
use histview_core::{ConnectionDescriptor, TableRef};

/// Layer ids of the project's table map, standing in for a host's layers.
///
/// None of them has an edit session, so they never bracket a replay.
pub struct ProjectLayers {
    layers: Vec<Arc<dyn EditableLayer>>,
}

impl ProjectLayers {
    pub fn from_table_map(table_map: &BTreeMap<String, TableRef>) -> Self {
        let layers = table_map
            .iter()
            .map(|(id, table)| {
                Arc::new(TableLayer { id: id.clone(), table: table.clone() }) as Arc<dyn EditableLayer>
            })
            .collect();
        Self { layers }
    }
}

impl LayerRegistry for ProjectLayers {
    fn layers(&self) -> Vec<Arc<dyn EditableLayer>> {
        self.layers.clone()
    }
}

struct TableLayer {
    id: String,
    table: TableRef,
}

impl EditableLayer for TableLayer {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn name(&self) -> String {
        self.table.to_string()
    }

    fn source(&self) -> Option<ConnectionDescriptor> {
        None
    }

    fn is_editing(&self) -> bool {
        false
    }

    fn start_editing(&self) -> bool {
        false
    }

    fn end_editing(&self, _commit: bool) -> Result<(), String> {
        Ok(())
    }
}
