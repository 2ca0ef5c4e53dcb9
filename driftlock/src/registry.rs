use crate::errors::MigrateError;
use crate::id::UnitId;
use crate::unit::MigrationUnit;

/// Ordered, append-only collection of migration units.
///
/// Units are kept sorted by id ascending, so `list()` is deterministic
/// across processes and invocations. Discovery is pure: building a registry
/// has no side effects on the database.
#[derive(Debug, Default)]
pub struct Registry {
    units: Vec<MigrationUnit>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from an iterator of units, rejecting duplicates.
    pub fn from_units<I>(units: I) -> Result<Self, MigrateError>
    where
        I: IntoIterator<Item = MigrationUnit>,
    {
        let mut registry = Self::new();
        for unit in units {
            registry.push(unit)?;
        }
        Ok(registry)
    }

    /// Insert a unit in id order. Fails with `DuplicateId` if a unit with
    /// the same id is already registered.
    pub fn push(&mut self, unit: MigrationUnit) -> Result<(), MigrateError> {
        match self.units.binary_search_by(|u| u.id.cmp(&unit.id)) {
            Ok(_) => Err(MigrateError::DuplicateId(unit.id)),
            Err(position) => {
                self.units.insert(position, unit);
                Ok(())
            }
        }
    }

    /// All units, sorted by id ascending.
    pub fn list(&self) -> &[MigrationUnit] {
        &self.units
    }

    pub fn get(&self, id: &UnitId) -> Option<&MigrationUnit> {
        self.units
            .binary_search_by(|u| u.id.cmp(id))
            .ok()
            .map(|position| &self.units[position])
    }

    pub fn contains(&self, id: &UnitId) -> bool {
        self.get(id).is_some()
    }

    /// Highest-ordered unit id, if any units are registered.
    pub fn latest(&self) -> Option<&UnitId> {
        self.units.last().map(|u| &u.id)
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(id: &str) -> MigrationUnit {
        MigrationUnit::new(UnitId::parse(id).unwrap(), vec![], vec![])
    }

    #[test]
    fn lists_units_in_id_order_regardless_of_insertion() {
        let registry = Registry::from_units([
            unit("20250103000000-c"),
            unit("20250101000000-a"),
            unit("20250102000000-b"),
        ])
        .unwrap();

        let ids: Vec<_> = registry.list().iter().map(|u| u.id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "20250101000000-a",
                "20250102000000-b",
                "20250103000000-c",
            ]
        );
        assert_eq!(registry.latest().unwrap().as_str(), "20250103000000-c");
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut registry = Registry::new();
        registry.push(unit("20250101000000-a")).unwrap();
        let err = registry.push(unit("20250101000000-a")).unwrap_err();
        assert!(matches!(err, MigrateError::DuplicateId(_)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn lookup_by_id() {
        let registry = Registry::from_units([unit("20250101000000-a")]).unwrap();
        let id = UnitId::parse("20250101000000-a").unwrap();
        assert!(registry.contains(&id));
        assert!(registry.get(&UnitId::parse("20250102000000-b").unwrap()).is_none());
    }

    #[test]
    fn empty_registry_has_no_latest() {
        let registry = Registry::new();
        assert!(registry.is_empty());
        assert!(registry.latest().is_none());
    }
}
