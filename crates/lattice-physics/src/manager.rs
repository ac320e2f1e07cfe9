//! World Manager
//!
//! Owns every physics world of a session. World 0 is created with the
//! manager and lives as long as it.

use crate::config::WorldSettings;
use crate::error::{PhysicsError, PhysicsResult};
use crate::layers::LayerTable;
use crate::world::{PhysicsWorld, WorldId};

/// The main world, never destroyable
pub const MAIN_WORLD: WorldId = 0;

#[derive(Debug)]
pub struct WorldManager {
    worlds: Vec<Option<PhysicsWorld>>,
}

impl WorldManager {
    /// Create the manager along with the main world
    pub fn new(settings: &WorldSettings) -> PhysicsResult<Self> {
        let main = PhysicsWorld::new(MAIN_WORLD, settings)?;
        Ok(Self {
            worlds: vec![Some(main)],
        })
    }

    /// Create a world, reusing the first freed slot
    pub fn create_world(&mut self, settings: &WorldSettings) -> PhysicsResult<WorldId> {
        let free = self.worlds.iter().position(Option::is_none);
        let id = free.unwrap_or(self.worlds.len()) as WorldId;
        let world = PhysicsWorld::new(id, settings)?;

        match free {
            Some(index) => self.worlds[index] = Some(world),
            None => self.worlds.push(Some(world)),
        }
        log::debug!("World {} created", id);
        Ok(id)
    }

    /// Free a world with its listener, scratch memory and job pool
    pub fn destroy_world(&mut self, id: WorldId) -> PhysicsResult<()> {
        if id == MAIN_WORLD {
            log::error!("The main world can't be destroyed");
            return Err(PhysicsError::WorldNotDestroyable(id));
        }
        let Some(slot) = self.worlds.get_mut(id as usize) else {
            return Err(PhysicsError::InvalidWorld(id));
        };
        if slot.take().is_none() {
            return Err(PhysicsError::InvalidWorld(id));
        }
        log::debug!("World {} destroyed", id);
        Ok(())
    }

    pub fn world(&self, id: WorldId) -> PhysicsResult<&PhysicsWorld> {
        self.worlds
            .get(id as usize)
            .and_then(Option::as_ref)
            .ok_or(PhysicsError::InvalidWorld(id))
    }

    pub fn world_mut(&mut self, id: WorldId) -> PhysicsResult<&mut PhysicsWorld> {
        self.worlds
            .get_mut(id as usize)
            .and_then(Option::as_mut)
            .ok_or(PhysicsError::InvalidWorld(id))
    }

    pub fn main(&self) -> &PhysicsWorld {
        match self.worlds.first() {
            Some(Some(world)) => world,
            _ => panic!("The main world is missing"),
        }
    }

    pub fn main_mut(&mut self) -> &mut PhysicsWorld {
        match self.worlds.first_mut() {
            Some(Some(world)) => world,
            _ => panic!("The main world is missing"),
        }
    }

    pub fn contains(&self, id: WorldId) -> bool {
        self.world(id).is_ok()
    }

    pub fn worlds(&self) -> impl Iterator<Item = &PhysicsWorld> {
        self.worlds.iter().flatten()
    }

    pub fn worlds_mut(&mut self) -> impl Iterator<Item = &mut PhysicsWorld> {
        self.worlds.iter_mut().flatten()
    }

    pub fn world_count(&self) -> usize {
        self.worlds().count()
    }

    /// Propagate an edited layer table to every world
    pub fn apply_layer_table(&mut self, layers: &LayerTable) {
        for world in self.worlds_mut() {
            world.apply_layer_table(layers);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> WorldSettings {
        WorldSettings {
            max_bodies: 64,
            worker_threads: Some(1),
            ..WorldSettings::default()
        }
    }

    #[test]
    fn test_main_world_is_not_destroyable() {
        let mut manager = WorldManager::new(&settings()).unwrap();
        assert!(matches!(
            manager.destroy_world(MAIN_WORLD),
            Err(PhysicsError::WorldNotDestroyable(0))
        ));
        assert_eq!(manager.world_count(), 1);
    }

    #[test]
    fn test_freed_slots_are_reused() {
        let mut manager = WorldManager::new(&settings()).unwrap();
        let a = manager.create_world(&settings()).unwrap();
        let b = manager.create_world(&settings()).unwrap();
        assert_eq!((a, b), (1, 2));

        manager.destroy_world(a).unwrap();
        assert!(manager.world(a).is_err());
        assert!(manager.destroy_world(a).is_err());

        assert_eq!(manager.create_world(&settings()).unwrap(), a);
        assert_eq!(manager.world(a).unwrap().id(), a);
        assert_eq!(manager.world_count(), 3);
    }

    #[test]
    fn test_capacity_is_rounded() {
        let manager = WorldManager::new(&WorldSettings {
            max_bodies: 100,
            worker_threads: Some(1),
            ..WorldSettings::default()
        })
        .unwrap();
        assert_eq!(manager.main().capacity().max_bodies, 128);
    }
}
