use std::collections::hash_map::Entry;
use std::ops::Index;

use fxhash::FxHashMap;

use crate::{GeometryKey, Scene, ScenePrimitive};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PrimitiveId(u32);

impl PrimitiveId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn get(&self) -> u32 {
        self.0
    }
}

/// One distinct geometry, shared by every scene primitive whose key
/// matches; created once and immutable afterwards.
#[derive(Clone, Copy, Debug)]
pub struct UniquePrimitive {
    key: GeometryKey,
    source: u32,
    vertex_count: u32,
    index_count: u32,
}

impl UniquePrimitive {
    pub fn key(&self) -> GeometryKey {
        self.key
    }

    /// Index of the first scene primitive that produced this record.
    pub fn source(&self) -> u32 {
        self.source
    }

    pub fn mesh(&self) -> u32 {
        self.key.mesh
    }

    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }

    pub fn index_count(&self) -> u32 {
        self.index_count
    }
}

/// Deduplicates scene primitives by structural identity.
///
/// Ids are assigned in first-seen order and never move or get reused, so
/// re-interning a grown scene keeps all previously assigned ids while
/// appending fresh ones.
#[derive(Debug, Default)]
pub struct Primitives {
    items: Vec<UniquePrimitive>,
    index: FxHashMap<GeometryKey, PrimitiveId>,
}

impl Primitives {
    /// Interns all of the scene's primitives; the returned vector has one
    /// id per scene primitive, with duplicates mapping to the same id.
    pub fn intern_scene(&mut self, scene: &Scene) -> Vec<PrimitiveId> {
        scene
            .primitives
            .iter()
            .enumerate()
            .map(|(source, primitive)| {
                self.intern(scene, source as u32, primitive)
            })
            .collect()
    }

    pub fn intern(
        &mut self,
        scene: &Scene,
        source: u32,
        primitive: &ScenePrimitive,
    ) -> PrimitiveId {
        match self.index.entry(primitive.key()) {
            Entry::Occupied(entry) => *entry.get(),

            Entry::Vacant(entry) => {
                let vertex_count = scene
                    .accessor(primitive.positions)
                    .map(|accessor| accessor.count)
                    .unwrap_or(0);

                let index_count = primitive
                    .indices
                    .and_then(|id| scene.accessor(id).ok())
                    .map(|accessor| accessor.count)
                    .unwrap_or(0);

                let id = PrimitiveId::new(self.items.len() as u32);

                self.items.push(UniquePrimitive {
                    key: *entry.key(),
                    source,
                    vertex_count,
                    index_count,
                });

                entry.insert(id);

                id
            }
        }
    }

    pub fn lookup(&self, key: &GeometryKey) -> Option<PrimitiveId> {
        self.index.get(key).copied()
    }

    pub fn iter(
        &self,
    ) -> impl Iterator<Item = (PrimitiveId, &UniquePrimitive)> + '_ {
        self.items
            .iter()
            .enumerate()
            .map(|(id, item)| (PrimitiveId::new(id as u32), item))
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.index.clear();
    }
}

impl Index<PrimitiveId> for Primitives {
    type Output = UniquePrimitive;

    fn index(&self, index: PrimitiveId) -> &Self::Output {
        &self.items[index.get() as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Accessor, Format};

    fn scene() -> Scene {
        let mut scene = Scene::default();

        scene.accessors = vec![
            Accessor::packed(0, 4, Format::F32x3),
            Accessor::packed(0, 6, Format::U32),
            Accessor::packed(0, 9, Format::F32x3),
        ];

        let mut shared = ScenePrimitive::new(0, 0);
        shared.indices = Some(1);

        scene.primitives = vec![
            shared,
            ScenePrimitive::new(0, 2),
            shared,
        ];

        scene
    }

    #[test]
    fn duplicates_map_to_one_id() {
        let scene = scene();
        let mut primitives = Primitives::default();

        let ids = primitives.intern_scene(&scene);

        assert_eq!(
            vec![
                PrimitiveId::new(0),
                PrimitiveId::new(1),
                PrimitiveId::new(0)
            ],
            ids,
        );

        assert_eq!(2, primitives.len());
    }

    #[test]
    fn ids_survive_reinterning_a_grown_scene() {
        let mut scene = scene();
        let mut primitives = Primitives::default();

        let ids = primitives.intern_scene(&scene);

        scene.primitives.push(ScenePrimitive::new(1, 2));

        let ids_after = primitives.intern_scene(&scene);

        assert_eq!(ids, ids_after[0..3]);
        assert_eq!(PrimitiveId::new(2), ids_after[3]);
        assert_eq!(3, primitives.len());
    }

    #[test]
    fn records_carry_declared_counts() {
        let scene = scene();
        let mut primitives = Primitives::default();

        primitives.intern_scene(&scene);

        let with_indices = &primitives[PrimitiveId::new(0)];
        let without_indices = &primitives[PrimitiveId::new(1)];

        assert_eq!(4, with_indices.vertex_count());
        assert_eq!(6, with_indices.index_count());
        assert_eq!(0, with_indices.source());

        assert_eq!(9, without_indices.vertex_count());
        assert_eq!(0, without_indices.index_count());
        assert_eq!(1, without_indices.source());
    }

    #[test]
    fn lookup_finds_interned_keys() {
        let scene = scene();
        let mut primitives = Primitives::default();

        primitives.intern_scene(&scene);

        assert_eq!(
            Some(PrimitiveId::new(1)),
            primitives.lookup(&scene.primitives[1].key()),
        );

        assert_eq!(None, primitives.lookup(&ScenePrimitive::new(7, 0).key()));
    }
}
