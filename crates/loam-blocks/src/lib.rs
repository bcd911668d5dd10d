//! Block table: voxel ids and names, loaded from a TOML document.
#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::error::Error;
use std::fs;
use std::path::Path;

use serde::Deserialize;

/// Voxel cell value. One byte per voxel; id 0 is always air.
pub type BlockId = u8;

pub const AIR: BlockId = 0;

#[derive(Debug, Clone)]
pub struct BlockType {
    pub id: BlockId,
    pub name: String,
    pub solid: bool,
}

#[derive(Debug, Deserialize)]
struct BlocksConfig {
    blocks: Vec<BlockDef>,
}

#[derive(Debug, Deserialize)]
struct BlockDef {
    name: String,
    id: Option<BlockId>,
    solid: Option<bool>,
}

/// Immutable lookup table shared by the generator and delivery layers.
#[derive(Debug, Default, Clone)]
pub struct BlockRegistry {
    pub blocks: Vec<BlockType>,
    pub by_name: HashMap<String, BlockId>,
}

impl BlockRegistry {
    #[inline]
    pub fn get(&self, id: BlockId) -> Option<&BlockType> {
        self.blocks.get(id as usize)
    }

    pub fn id_by_name(&self, name: &str) -> Option<BlockId> {
        self.by_name.get(name).copied()
    }

    /// Resolve a name to an id, falling back to air for unknown names.
    pub fn id_or_air(&self, name: &str) -> BlockId {
        self.id_by_name(name).unwrap_or(AIR)
    }

    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, Box<dyn Error>> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, Box<dyn Error>> {
        let cfg: BlocksConfig = toml::from_str(text)?;
        let mut reg = BlockRegistry::default();
        for def in cfg.blocks.into_iter() {
            let id = def.id.unwrap_or(reg.blocks.len() as BlockId);
            if reg.by_name.contains_key(&def.name) {
                return Err(format!("duplicate block name '{}'", def.name).into());
            }
            if reg.blocks.iter().any(|b| b.id == id) {
                return Err(format!("duplicate block id {} ('{}')", id, def.name).into());
            }
            reg.by_name.insert(def.name.clone(), id);
            reg.blocks.push(BlockType {
                id,
                name: def.name,
                solid: def.solid.unwrap_or(true),
            });
        }
        match reg.id_by_name("air") {
            Some(AIR) => Ok(reg),
            _ => Err("block table must define 'air' with id 0".into()),
        }
    }
}
