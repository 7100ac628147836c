//! Collection domain model.
//!
//! # Responsibility
//! - Define the canonical collection entity and its property bag.
//! - Own construction-time validation (`Collection::create`).
//! - Provide membership editing that keeps the post list well formed.
//!
//! # Invariants
//! - `id` and `kind` never change after construction.
//! - Automatic collections always carry a filter (possibly empty) that passes
//!   the syntax check; manual collections never carry a non-empty filter.
//! - `posts` holds no duplicates and its order is display order.
//! - `updated_at >= created_at`.
//! - `deleted` is transient and never serialized.

use crate::model::filter::{validate_filter, FilterSyntaxError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;
use uuid::Uuid;

/// Opaque collection identifier.
pub type CollectionId = String;

/// Opaque member-item (post) identifier.
pub type PostId = String;

/// Slugs of built-in collections that cannot be deleted.
const BUILT_IN_SLUGS: &[&str] = &["latest", "featured"];

/// How membership of a collection is decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionType {
    /// Membership derived externally from `filter`.
    Automatic,
    /// Membership curated by hand.
    Manual,
}

impl CollectionType {
    /// Storage/wire spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Automatic => "automatic",
            Self::Manual => "manual",
        }
    }

    /// Parses the storage/wire spelling. Unknown values yield `None`.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "automatic" => Some(Self::Automatic),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }
}

/// Domain invariant violations raised by the factory and entity operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollectionValidationError {
    #[error("collection id cannot be empty")]
    EmptyId,
    #[error("collection slug cannot be empty")]
    EmptySlug,
    #[error("unknown collection type `{0}`; expected automatic|manual")]
    UnknownType(String),
    #[error("automatic collection requires a filter")]
    MissingFilter,
    #[error("manual collection cannot have a filter, got `{0}`")]
    FilterOnManual(String),
    #[error("invalid filter `{filter}`: {source}")]
    InvalidFilter {
        filter: String,
        #[source]
        source: FilterSyntaxError,
    },
    #[error("updated_at {updated_at} is earlier than created_at {created_at}")]
    TimestampOrder {
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    },
    #[error("post `{0}` appears more than once")]
    DuplicatePost(PostId),
    #[error("built-in collection `{0}` cannot be deleted")]
    NotDeletable(String),
}

/// Flat, loosely-typed input accepted by [`Collection::create`].
///
/// Mirrors what a storage row or an API payload can provide; every
/// constraint is checked by the factory, not by this type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionProps {
    /// Generated when `None`.
    pub id: Option<String>,
    pub slug: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub filter: Option<String>,
    /// Raw type spelling; `None` means manual.
    pub kind: Option<String>,
    pub feature_image: Option<String>,
    pub posts: Vec<PostId>,
    /// Defaults to "now" when `None`.
    pub created_at: Option<DateTime<Utc>>,
    /// Defaults to "now" when `None`.
    pub updated_at: Option<DateTime<Utc>>,
    pub deleted: bool,
}

/// Patch for [`Collection::edit`]. Outer `None` leaves a field untouched;
/// `Some(None)` clears a nullable field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionEdit {
    pub slug: Option<String>,
    pub title: Option<Option<String>>,
    pub description: Option<Option<String>>,
    pub filter: Option<Option<String>>,
    pub feature_image: Option<Option<String>>,
}

/// A named, ordered grouping of posts.
///
/// Only serializable: every instance must come from [`Collection::create`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Collection {
    id: CollectionId,
    slug: String,
    title: Option<String>,
    description: Option<String>,
    filter: Option<String>,
    #[serde(rename = "type")]
    kind: CollectionType,
    feature_image: Option<String>,
    posts: Vec<PostId>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(skip)]
    deleted: bool,
}

impl Collection {
    /// Builds a validated collection from a property bag.
    ///
    /// # Errors
    /// Returns the first violated invariant; see [`CollectionValidationError`].
    pub fn create(props: CollectionProps) -> Result<Self, CollectionValidationError> {
        let id = match props.id {
            Some(id) if id.trim().is_empty() => return Err(CollectionValidationError::EmptyId),
            Some(id) => id,
            None => Uuid::new_v4().simple().to_string(),
        };

        let kind = match props.kind.as_deref() {
            None => CollectionType::Manual,
            Some(raw) => CollectionType::parse(raw)
                .ok_or_else(|| CollectionValidationError::UnknownType(raw.to_string()))?,
        };

        validate_slug(&props.slug)?;
        check_filter(kind, props.filter.as_deref())?;
        check_unique_posts(&props.posts)?;

        let now = Utc::now();
        let created_at = props.created_at.unwrap_or(now);
        let updated_at = props.updated_at.unwrap_or(now);
        if updated_at < created_at {
            return Err(CollectionValidationError::TimestampOrder {
                created_at,
                updated_at,
            });
        }

        Ok(Self {
            id,
            slug: props.slug,
            title: props.title,
            description: props.description,
            filter: props.filter,
            kind,
            feature_image: props.feature_image,
            posts: props.posts,
            created_at,
            updated_at,
            deleted: props.deleted,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn slug(&self) -> &str {
        &self.slug
    }

    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn filter(&self) -> Option<&str> {
        self.filter.as_deref()
    }

    pub fn kind(&self) -> CollectionType {
        self.kind
    }

    pub fn feature_image(&self) -> Option<&str> {
        self.feature_image.as_deref()
    }

    /// Member post ids in display order.
    pub fn posts(&self) -> &[PostId] {
        &self.posts
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Whether the next save should remove this collection.
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Built-in collections (`latest`, `featured`) are never deletable.
    pub fn is_deletable(&self) -> bool {
        !BUILT_IN_SLUGS.contains(&self.slug.as_str())
    }

    /// Flags this collection for removal on the next save.
    pub fn mark_deleted(&mut self) -> Result<(), CollectionValidationError> {
        if !self.is_deletable() {
            return Err(CollectionValidationError::NotDeletable(self.slug.clone()));
        }
        self.deleted = true;
        Ok(())
    }

    /// Applies a patch atomically: nothing changes when validation fails.
    pub fn edit(&mut self, patch: CollectionEdit) -> Result<(), CollectionValidationError> {
        if let Some(slug) = patch.slug.as_deref() {
            validate_slug(slug)?;
        }
        if let Some(filter) = &patch.filter {
            check_filter(self.kind, filter.as_deref())?;
        }

        if let Some(slug) = patch.slug {
            self.slug = slug;
        }
        if let Some(title) = patch.title {
            self.title = title;
        }
        if let Some(description) = patch.description {
            self.description = description;
        }
        if let Some(filter) = patch.filter {
            self.filter = filter;
        }
        if let Some(feature_image) = patch.feature_image {
            self.feature_image = feature_image;
        }
        self.touch();
        Ok(())
    }

    /// Inserts a post at `index` (clamped to the list length) or appends it.
    ///
    /// Returns `false` when the post is already a member.
    pub fn add_post(&mut self, post_id: impl Into<PostId>, index: Option<usize>) -> bool {
        let post_id = post_id.into();
        if self.includes_post(&post_id) {
            return false;
        }
        match index {
            Some(index) => self.posts.insert(index.min(self.posts.len()), post_id),
            None => self.posts.push(post_id),
        }
        self.touch();
        true
    }

    /// Returns `false` when the post was not a member.
    pub fn remove_post(&mut self, post_id: &str) -> bool {
        let before = self.posts.len();
        self.posts.retain(|id| id != post_id);
        let removed = self.posts.len() != before;
        if removed {
            self.touch();
        }
        removed
    }

    pub fn includes_post(&self, post_id: &str) -> bool {
        self.posts.iter().any(|id| id == post_id)
    }

    pub fn remove_all_posts(&mut self) {
        if !self.posts.is_empty() {
            self.posts.clear();
            self.touch();
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now().max(self.created_at);
    }
}

fn validate_slug(slug: &str) -> Result<(), CollectionValidationError> {
    if slug.trim().is_empty() {
        return Err(CollectionValidationError::EmptySlug);
    }
    Ok(())
}

fn check_filter(
    kind: CollectionType,
    filter: Option<&str>,
) -> Result<(), CollectionValidationError> {
    match (kind, filter) {
        (CollectionType::Automatic, None) => Err(CollectionValidationError::MissingFilter),
        (CollectionType::Automatic, Some(filter)) => {
            validate_filter(filter).map_err(|source| CollectionValidationError::InvalidFilter {
                filter: filter.to_string(),
                source,
            })
        }
        (CollectionType::Manual, Some(filter)) if !filter.trim().is_empty() => {
            Err(CollectionValidationError::FilterOnManual(filter.to_string()))
        }
        (CollectionType::Manual, _) => Ok(()),
    }
}

fn check_unique_posts(posts: &[PostId]) -> Result<(), CollectionValidationError> {
    let mut seen = HashSet::with_capacity(posts.len());
    for post_id in posts {
        if !seen.insert(post_id.as_str()) {
            return Err(CollectionValidationError::DuplicatePost(post_id.clone()));
        }
    }
    Ok(())
}
