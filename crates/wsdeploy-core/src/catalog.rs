//! Built-in item types: what is published through the items API, and which
//! types have to exist before others can reference them.

use crate::graph::TypeDependencies;
use crate::item::ItemType;

/// Publishing traits of one built-in item type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub item_type: ItemType,
    /// Published from metadata only; definition files are never uploaded.
    pub shell_only: bool,
    /// Items of this type reference peers of the same type.
    pub scans_references: bool,
    /// Unpublishing destroys data, so it must be enabled explicitly.
    pub gated_unpublish: bool,
}

const fn entry(
    item_type: ItemType,
    shell_only: bool,
    scans_references: bool,
    gated_unpublish: bool,
) -> CatalogEntry {
    CatalogEntry {
        item_type,
        shell_only,
        scans_references,
        gated_unpublish,
    }
}

const fn plain(item_type: ItemType) -> CatalogEntry {
    entry(item_type, false, false, false)
}

const fn storage(item_type: ItemType) -> CatalogEntry {
    entry(item_type, true, false, true)
}

pub static CATALOG: &[CatalogEntry] = &[
    plain(ItemType::VARIABLE_LIBRARY),
    storage(ItemType::WAREHOUSE),
    storage(ItemType::LAKEHOUSE),
    storage(ItemType::SQL_DATABASE),
    plain(ItemType::MIRRORED_DATABASE),
    entry(ItemType::ENVIRONMENT, true, false, false),
    plain(ItemType::NOTEBOOK),
    plain(ItemType::SPARK_JOB_DEFINITION),
    plain(ItemType::SEMANTIC_MODEL),
    plain(ItemType::REPORT),
    plain(ItemType::COPY_JOB),
    plain(ItemType::EVENTHOUSE),
    plain(ItemType::KQL_DATABASE),
    plain(ItemType::KQL_QUERYSET),
    plain(ItemType::REFLEX),
    plain(ItemType::EVENTSTREAM),
    plain(ItemType::KQL_DASHBOARD),
    plain(ItemType::DATAFLOW),
    entry(ItemType::DATA_PIPELINE, false, true, false),
    plain(ItemType::GRAPHQL_API),
    plain(ItemType::USER_DATA_FUNCTION),
];

/// Look up a built-in type.
pub fn lookup(item_type: &ItemType) -> Option<&'static CatalogEntry> {
    CATALOG.iter().find(|entry| &entry.item_type == item_type)
}

/// Types whose removal must be enabled explicitly.
pub fn gated_unpublish_types() -> impl Iterator<Item = &'static ItemType> {
    CATALOG
        .iter()
        .filter(|entry| entry.gated_unpublish)
        .map(|entry| &entry.item_type)
}

/// The "type X depends on type Y" table for built-in types.
pub fn type_dependencies() -> TypeDependencies {
    use ItemType as T;

    let storage = [T::LAKEHOUSE, T::WAREHOUSE, T::SQL_DATABASE, T::MIRRORED_DATABASE];
    let mut table = TypeDependencies::new();

    // Everything may read variables.
    for entry in CATALOG {
        if entry.item_type != T::VARIABLE_LIBRARY {
            table.add(entry.item_type.clone(), T::VARIABLE_LIBRARY);
        }
    }

    table.add(T::NOTEBOOK, T::ENVIRONMENT);
    for dependency in &storage {
        table.add(T::NOTEBOOK, dependency.clone());
    }
    table
        .add(T::SPARK_JOB_DEFINITION, T::ENVIRONMENT)
        .add(T::SPARK_JOB_DEFINITION, T::LAKEHOUSE);
    for dependency in &storage {
        table.add(T::SEMANTIC_MODEL, dependency.clone());
        table.add(T::COPY_JOB, dependency.clone());
        table.add(T::DATAFLOW, dependency.clone());
        table.add(T::GRAPHQL_API, dependency.clone());
    }
    table.add(T::REPORT, T::SEMANTIC_MODEL);

    table
        .add(T::KQL_DATABASE, T::EVENTHOUSE)
        .add(T::KQL_QUERYSET, T::KQL_DATABASE)
        .add(T::KQL_DASHBOARD, T::KQL_DATABASE)
        .add(T::EVENTSTREAM, T::EVENTHOUSE)
        .add(T::EVENTSTREAM, T::KQL_DATABASE)
        .add(T::EVENTSTREAM, T::LAKEHOUSE)
        .add(T::EVENTSTREAM, T::REFLEX);

    for dependency in [
        T::NOTEBOOK,
        T::SPARK_JOB_DEFINITION,
        T::DATAFLOW,
        T::COPY_JOB,
        T::SEMANTIC_MODEL,
        T::USER_DATA_FUNCTION,
    ] {
        table.add(T::DATA_PIPELINE, dependency);
    }

    table
}
