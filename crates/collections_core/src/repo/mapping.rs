//! Explicit mapping between storage shapes and the collection entity.
//!
//! # Responsibility
//! - Turn a [`CollectionRow`] into a property bag and then a [`Collection`].
//! - Flatten a [`Collection`] into a [`CollectionRecord`] for writes.
//! - Collapse mapping failures into absence, reporting each one exactly once.
//!
//! # Invariants
//! - Every field pair is listed explicitly; columns not named here are ignored.
//! - Automatic rows with a missing filter map to `filter = ""`; manual rows
//!   keep whatever the row holds.
//! - Membership order is the order of `CollectionRow::collection_posts`.

use crate::model::collection::{
    Collection, CollectionProps, CollectionType, CollectionValidationError,
};
use crate::store::{CollectionRecord, CollectionRow, MembershipDescriptor};
use crate::telemetry::ErrorReporter;
use chrono::{DateTime, SecondsFormat, Utc};
use log::error;
use thiserror::Error;

/// A stored row that cannot become a valid entity.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MappingError {
    #[error("collection `{id}` has a non-text value in `{column}`")]
    UndecodableColumn { id: String, column: &'static str },
    #[error("collection `{id}` has invalid {field} `{value}`")]
    InvalidTimestamp {
        id: String,
        field: &'static str,
        value: String,
    },
    #[error("collection `{id}` failed validation: {source}")]
    Invalid {
        id: String,
        #[source]
        source: CollectionValidationError,
    },
}

/// Builds the factory input for a stored row.
pub fn row_to_props(row: &CollectionRow) -> Result<CollectionProps, MappingError> {
    if let Some(column) = row.undecodable_column {
        return Err(MappingError::UndecodableColumn {
            id: row.id.clone(),
            column,
        });
    }

    let filter = match (CollectionType::parse(&row.kind), &row.filter) {
        (Some(CollectionType::Automatic), None) => Some(String::new()),
        (_, filter) => filter.clone(),
    };

    Ok(CollectionProps {
        id: Some(row.id.clone()),
        slug: row.slug.clone(),
        title: row.title.clone(),
        description: row.description.clone(),
        filter,
        kind: Some(row.kind.clone()),
        feature_image: row.feature_image.clone(),
        posts: row
            .collection_posts
            .iter()
            .map(|membership| membership.post_id.clone())
            .collect(),
        created_at: Some(parse_timestamp(&row.id, "created_at", &row.created_at)?),
        updated_at: Some(parse_timestamp(&row.id, "updated_at", &row.updated_at)?),
        deleted: false,
    })
}

/// Maps a stored row to a validated entity.
pub fn row_to_collection(row: &CollectionRow) -> Result<Collection, MappingError> {
    let props = row_to_props(row)?;
    Collection::create(props).map_err(|source| MappingError::Invalid {
        id: row.id.clone(),
        source,
    })
}

/// Flattens an entity into the shape written by stores.
pub fn collection_to_record(collection: &Collection) -> CollectionRecord {
    CollectionRecord {
        id: collection.id().to_string(),
        slug: collection.slug().to_string(),
        title: collection.title().map(str::to_string),
        description: collection.description().map(str::to_string),
        filter: collection.filter().map(str::to_string),
        kind: collection.kind(),
        feature_image: collection.feature_image().map(str::to_string),
        posts: collection
            .posts()
            .iter()
            .map(|post_id| MembershipDescriptor {
                post_id: post_id.clone(),
            })
            .collect(),
        created_at: format_timestamp(collection.created_at()),
        updated_at: format_timestamp(collection.updated_at()),
    }
}

/// Turns a mapping result into an optional entity.
///
/// A failure is logged and sent to `reporter` once, then dropped: a corrupt
/// row reads as an absent collection.
pub fn collapse_mapping_failure(
    result: Result<Collection, MappingError>,
    reporter: &dyn ErrorReporter,
) -> Option<Collection> {
    match result {
        Ok(collection) => Some(collection),
        Err(err) => {
            error!("event=collection_map module=repo status=error error={err}");
            reporter.capture_exception(&err);
            None
        }
    }
}

/// Fixed-width RFC 3339 in UTC, so text order matches time order.
pub fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(
    id: &str,
    field: &'static str,
    value: &str,
) -> Result<DateTime<Utc>, MappingError> {
    DateTime::parse_from_rfc3339(value)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|_| MappingError::InvalidTimestamp {
            id: id.to_string(),
            field,
            value: value.to_string(),
        })
}
