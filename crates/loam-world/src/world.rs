use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};

use crate::props::WorldProps;

/// A named chunk namespace with generation parameters and day/night
/// state. Lives for the process lifetime; the live chunk map is owned by
/// the server state, not here.
#[derive(Debug)]
pub struct World {
    pub props: WorldProps,
    dir: PathBuf,
}

impl World {
    /// Create a world from properties, persisting them immediately.
    pub fn create(data_dir: &Path, props: WorldProps) -> Result<Self, Box<dyn Error>> {
        let world = Self {
            dir: data_dir.join("worlds").join(&props.name),
            props,
        };
        world.save_props()?;
        Ok(world)
    }

    /// Load a world from its saved properties file.
    pub fn load(data_dir: &Path, name: &str) -> Result<Self, Box<dyn Error>> {
        let dir = data_dir.join("worlds").join(name);
        let text = fs::read_to_string(dir.join("world.toml"))?;
        let props: WorldProps = toml::from_str(&text)?;
        Ok(Self { props, dir })
    }

    pub fn exists(data_dir: &Path, name: &str) -> bool {
        data_dir.join("worlds").join(name).is_dir()
    }

    pub fn open_or_create(data_dir: &Path, props: WorldProps) -> Result<Self, Box<dyn Error>> {
        if Self::exists(data_dir, &props.name) {
            Self::load(data_dir, &props.name)
        } else {
            Self::create(data_dir, props)
        }
    }

    /// Rewrite the properties file, creating the world and region
    /// directories as needed.
    pub fn save_props(&self) -> Result<(), Box<dyn Error>> {
        fs::create_dir_all(self.regions_dir())?;
        fs::write(self.dir.join("world.toml"), toml::to_string(&self.props)?)?;
        Ok(())
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.props.name
    }

    #[inline]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[inline]
    pub fn regions_dir(&self) -> PathBuf {
        self.dir.join("regions")
    }

    /// Once-per-tick housekeeping.
    pub fn update(&mut self) {
        self.props.advance_daytime();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::props::TerrainKind;

    #[test]
    fn create_persists_and_reloads() {
        let tmp = tempfile::tempdir().unwrap();
        let world = World::create(tmp.path(), WorldProps::flatland()).unwrap();
        assert!(world.regions_dir().is_dir());
        assert!(World::exists(tmp.path(), "flatland"));

        let back = World::load(tmp.path(), "flatland").unwrap();
        assert_eq!(back.props.kind, TerrainKind::Flat);
        assert_eq!(back.props.spawn, [272, 258, 272]);
        assert_eq!(back.props.daycycle, 0);
    }

    #[test]
    fn open_or_create_prefers_saved_props() {
        let tmp = tempfile::tempdir().unwrap();
        let mut world = World::create(tmp.path(), WorldProps::default()).unwrap();
        world.props.daytime = 0.75;
        world.save_props().unwrap();

        let reopened = World::open_or_create(tmp.path(), WorldProps::default()).unwrap();
        assert_eq!(reopened.props.daytime, 0.75);
    }

    #[test]
    fn load_missing_world_errors() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(World::load(tmp.path(), "nope").is_err());
    }
}
