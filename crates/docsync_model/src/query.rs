//! Queries and the targets the backend listens to.
//!
//! A [`Query`] is what the application asks for. A [`Target`] is the
//! normalized descriptor sent to the backend; two queries that only differ in
//! how a limit is anchored may share one.

use crate::document::Document;
use crate::error::{ModelError, ModelResult};
use crate::path::{DocumentKey, FieldPath, ResourcePath};
use crate::sorted_map::Comparator;
use crate::value::FieldValue;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// Filter operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    /// `<`
    LessThan,
    /// `<=`
    LessThanOrEqual,
    /// `==`
    Equal,
    /// `>`
    GreaterThan,
    /// `>=`
    GreaterThanOrEqual,
    /// `array-contains`
    ArrayContains,
    /// `in`
    In,
    /// `array-contains-any`
    ArrayContainsAny,
}

impl Operator {
    /// True for range comparisons.
    pub fn is_inequality(self) -> bool {
        matches!(
            self,
            Operator::LessThan | Operator::LessThanOrEqual | Operator::GreaterThan | Operator::GreaterThanOrEqual
        )
    }

    fn matches_comparison(self, ordering: Ordering) -> bool {
        match self {
            Operator::LessThan => ordering == Ordering::Less,
            Operator::LessThanOrEqual => ordering != Ordering::Greater,
            Operator::Equal | Operator::In => ordering == Ordering::Equal,
            Operator::GreaterThan => ordering == Ordering::Greater,
            Operator::GreaterThanOrEqual => ordering != Ordering::Less,
            Operator::ArrayContains | Operator::ArrayContainsAny => false,
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operator::LessThan => "<",
            Operator::LessThanOrEqual => "<=",
            Operator::Equal => "==",
            Operator::GreaterThan => ">",
            Operator::GreaterThanOrEqual => ">=",
            Operator::ArrayContains => "array-contains",
            Operator::In => "in",
            Operator::ArrayContainsAny => "array-contains-any",
        })
    }
}

/// A `field op value` filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldFilter {
    field: FieldPath,
    op: Operator,
    value: FieldValue,
}

impl FieldFilter {
    /// Creates a filter, rejecting combinations the backend cannot evaluate.
    pub fn create(field: FieldPath, op: Operator, value: FieldValue) -> ModelResult<Self> {
        if field.is_key_field() {
            if op == Operator::In {
                let all_references = value
                    .as_array()
                    .is_some_and(|values| values.iter().all(|v| matches!(v, FieldValue::Reference(_))));
                if !all_references {
                    return Err(ModelError::invalid_argument(
                        "'in' filters on the document key need an array of references",
                    ));
                }
            } else {
                if !matches!(value, FieldValue::Reference(_)) {
                    return Err(ModelError::invalid_argument(
                        "filters on the document key need a reference value",
                    ));
                }
                if matches!(op, Operator::ArrayContains | Operator::ArrayContainsAny) {
                    return Err(ModelError::invalid_argument(format!(
                        "'{op}' filters make no sense on document keys"
                    )));
                }
            }
        } else if matches!(value, FieldValue::Null) && op != Operator::Equal {
            return Err(ModelError::invalid_argument("null supports only equality comparisons"));
        } else if value.is_nan() && op != Operator::Equal {
            return Err(ModelError::invalid_argument("NaN supports only equality comparisons"));
        } else if matches!(op, Operator::In | Operator::ArrayContainsAny) && value.as_array().is_none() {
            return Err(ModelError::invalid_argument(format!("'{op}' filters need an array value")));
        }
        Ok(Self { field, op, value })
    }

    /// The filtered field.
    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    /// The operator.
    pub fn op(&self) -> Operator {
        self.op
    }

    /// The operand.
    pub fn value(&self) -> &FieldValue {
        &self.value
    }

    /// True for range comparisons.
    pub fn is_inequality(&self) -> bool {
        self.op.is_inequality()
    }

    /// Evaluates the filter against a document.
    pub fn matches(&self, doc: &Document) -> bool {
        if self.field.is_key_field() {
            return match (&self.op, &self.value) {
                (Operator::In, value) => value.array_contains(&FieldValue::Reference(doc.key().clone())),
                (op, FieldValue::Reference(key)) => op.matches_comparison(doc.key().cmp(key)),
                _ => false,
            };
        }
        let Some(other) = doc.field(&self.field) else {
            return false;
        };
        match self.op {
            Operator::ArrayContains => other.array_contains(&self.value),
            Operator::In => self.value.array_contains(other),
            Operator::ArrayContainsAny => other
                .as_array()
                .is_some_and(|values| values.iter().any(|v| self.value.array_contains(v))),
            op => other.type_order() == self.value.type_order() && op.matches_comparison(other.compare(&self.value)),
        }
    }

    /// Deterministic string form.
    pub fn canonical_id(&self) -> String {
        format!("{}{}{}", self.field.canonical_string(), self.op, self.value.canonical_string())
    }
}

impl fmt::Display for FieldFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.field, self.op, self.value)
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Direction {
    /// Smallest first.
    #[default]
    Ascending,
    /// Largest first.
    Descending,
}

impl Direction {
    /// The opposite direction.
    pub fn flip(self) -> Self {
        match self {
            Direction::Ascending => Direction::Descending,
            Direction::Descending => Direction::Ascending,
        }
    }

    fn apply(self, ordering: Ordering) -> Ordering {
        match self {
            Direction::Ascending => ordering,
            Direction::Descending => ordering.reverse(),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::Ascending => "asc",
            Direction::Descending => "desc",
        })
    }
}

/// An ordering on one field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderBy {
    /// The sorted field.
    pub field: FieldPath,
    /// The direction.
    pub direction: Direction,
}

impl OrderBy {
    /// Creates an ordering.
    pub fn new(field: FieldPath, direction: Direction) -> Self {
        Self { field, direction }
    }

    /// Ascending order on `field`.
    pub fn ascending(field: FieldPath) -> Self {
        Self::new(field, Direction::Ascending)
    }

    /// Descending order on `field`.
    pub fn descending(field: FieldPath) -> Self {
        Self::new(field, Direction::Descending)
    }

    /// Compares two documents under this ordering.
    pub fn compare(&self, a: &Document, b: &Document) -> Ordering {
        let ordering = if self.field.is_key_field() {
            Document::compare_by_key(a, b)
        } else {
            Document::compare_by_field(&self.field, a, b)
        };
        self.direction.apply(ordering)
    }

    /// Deterministic string form.
    pub fn canonical_id(&self) -> String {
        format!("{}{}", self.field.canonical_string(), self.direction)
    }
}

/// A cursor position in query order.
///
/// `position` holds values for a prefix of the query's order-by fields.
/// `before` selects whether the bound sits just before or just after it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bound {
    /// Values for the leading order-by fields.
    pub position: Vec<FieldValue>,
    /// True if the bound is just before the position.
    pub before: bool,
}

impl Bound {
    /// Creates a bound.
    pub fn new(position: Vec<FieldValue>, before: bool) -> Self {
        Self { position, before }
    }

    /// Returns true if the bound sorts before `doc` under `order_by`.
    pub fn sorts_before_document(&self, order_by: &[OrderBy], doc: &Document) -> bool {
        assert!(
            self.position.len() <= order_by.len(),
            "bound has more components than the query's order-by"
        );
        let mut comparison = Ordering::Equal;
        for (component, ordering) in self.position.iter().zip(order_by) {
            comparison = if ordering.field.is_key_field() {
                component.compare(&FieldValue::Reference(doc.key().clone()))
            } else {
                match doc.field(&ordering.field) {
                    Some(value) => component.compare(value),
                    None => Ordering::Greater,
                }
            };
            comparison = ordering.direction.apply(comparison);
            if comparison != Ordering::Equal {
                break;
            }
        }
        if self.before {
            comparison != Ordering::Greater
        } else {
            comparison == Ordering::Less
        }
    }

    /// Deterministic string form.
    pub fn canonical_id(&self) -> String {
        let mut id = if self.before { "b:" } else { "a:" }.to_string();
        for component in &self.position {
            id.push_str(&component.canonical_string());
        }
        id
    }

    fn flipped(&self) -> Self {
        Self::new(self.position.clone(), !self.before)
    }
}

/// Which end of the ordered result a limit keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum LimitType {
    /// Keep the first `limit` documents.
    #[default]
    First,
    /// Keep the last `limit` documents.
    Last,
}

/// The backend-facing query descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    /// Parent path, or the document path for single-document targets.
    pub path: ResourcePath,
    /// Collection id when querying a collection group.
    pub collection_group: Option<String>,
    /// Filters.
    pub filters: Vec<FieldFilter>,
    /// Full ordering including the implicit key order.
    pub order_by: Vec<OrderBy>,
    /// Maximum number of results.
    pub limit: Option<usize>,
    /// Lower cursor.
    pub start_at: Option<Bound>,
    /// Upper cursor.
    pub end_at: Option<Bound>,
}

impl Target {
    /// A target for a single document.
    pub fn for_document(key: &DocumentKey) -> Self {
        Query::at_path(key.path().clone()).to_target()
    }

    /// True if the target addresses exactly one document.
    pub fn is_document_target(&self) -> bool {
        DocumentKey::is_document_key(&self.path) && self.collection_group.is_none() && self.filters.is_empty()
    }

    /// Deterministic string form used as a map key.
    pub fn canonical_id(&self) -> String {
        let mut id = self.path.canonical_string();
        if let Some(group) = &self.collection_group {
            id.push_str("|cg:");
            id.push_str(group);
        }
        id.push_str("|f:");
        for filter in &self.filters {
            id.push_str(&filter.canonical_id());
        }
        id.push_str("|ob:");
        for ordering in &self.order_by {
            id.push_str(&ordering.canonical_id());
        }
        if let Some(limit) = self.limit {
            id.push_str(&format!("|l:{limit}"));
        }
        if let Some(start) = &self.start_at {
            id.push_str("|lb:");
            id.push_str(&start.canonical_id());
        }
        if let Some(end) = &self.end_at {
            id.push_str("|ub:");
            id.push_str(&end.canonical_id());
        }
        id
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Target({})", self.canonical_id())
    }
}

/// An application query.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    path: ResourcePath,
    collection_group: Option<String>,
    explicit_order_by: Vec<OrderBy>,
    filters: Vec<FieldFilter>,
    limit: Option<usize>,
    limit_type: LimitType,
    start_at: Option<Bound>,
    end_at: Option<Bound>,
    order_by: Vec<OrderBy>,
}

impl Query {
    /// A query for the documents at `path`: a collection or a single document.
    pub fn at_path(path: ResourcePath) -> Self {
        Self::build(path, None)
    }

    /// A query across every collection named `collection_id`.
    pub fn collection_group(collection_id: impl Into<String>) -> Self {
        Self::build(ResourcePath::empty(), Some(collection_id.into()))
    }

    fn build(path: ResourcePath, collection_group: Option<String>) -> Self {
        let mut query = Self {
            path,
            collection_group,
            explicit_order_by: Vec::new(),
            filters: Vec::new(),
            limit: None,
            limit_type: LimitType::First,
            start_at: None,
            end_at: None,
            order_by: Vec::new(),
        };
        query.normalize();
        query
    }

    fn normalize(&mut self) {
        let key = FieldPath::key_field();
        let inequality = self.inequality_filter_field().cloned();
        self.order_by = match (inequality, self.explicit_order_by.first()) {
            (Some(field), None) if field.is_key_field() => vec![OrderBy::ascending(key)],
            (Some(field), None) => vec![OrderBy::ascending(field), OrderBy::ascending(key)],
            _ => {
                let mut order_by = self.explicit_order_by.clone();
                if !order_by.iter().any(|o| o.field.is_key_field()) {
                    let direction = order_by.last().map(|o| o.direction).unwrap_or_default();
                    order_by.push(OrderBy::new(key, direction));
                }
                order_by
            }
        };
    }

    /// Returns a copy with `filter` added.
    #[must_use]
    pub fn with_filter(&self, filter: FieldFilter) -> Self {
        let mut query = self.clone();
        query.filters.push(filter);
        query.normalize();
        query
    }

    /// Returns a copy with an explicit ordering appended.
    #[must_use]
    pub fn with_order_by(&self, order_by: OrderBy) -> Self {
        let mut query = self.clone();
        query.explicit_order_by.push(order_by);
        query.normalize();
        query
    }

    /// Returns a copy keeping only the first `limit` results.
    #[must_use]
    pub fn with_limit_to_first(&self, limit: usize) -> Self {
        let mut query = self.clone();
        query.limit = Some(limit);
        query.limit_type = LimitType::First;
        query
    }

    /// Returns a copy keeping only the last `limit` results.
    #[must_use]
    pub fn with_limit_to_last(&self, limit: usize) -> Self {
        let mut query = self.clone();
        query.limit = Some(limit);
        query.limit_type = LimitType::Last;
        query
    }

    /// Returns a copy with a lower cursor.
    #[must_use]
    pub fn with_start_at(&self, bound: Bound) -> Self {
        let mut query = self.clone();
        query.start_at = Some(bound);
        query
    }

    /// Returns a copy with an upper cursor.
    #[must_use]
    pub fn with_end_at(&self, bound: Bound) -> Self {
        let mut query = self.clone();
        query.end_at = Some(bound);
        query
    }

    /// Turns a collection group query into a collection query at `path`.
    #[must_use]
    pub fn as_collection_query_at_path(&self, path: ResourcePath) -> Self {
        let mut query = self.clone();
        query.path = path;
        query.collection_group = None;
        query
    }

    /// The query path.
    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    /// The collection group id, if any.
    pub fn collection_group_id(&self) -> Option<&str> {
        self.collection_group.as_deref()
    }

    /// The filters.
    pub fn filters(&self) -> &[FieldFilter] {
        &self.filters
    }

    /// The orderings the caller asked for.
    pub fn explicit_order_by(&self) -> &[OrderBy] {
        &self.explicit_order_by
    }

    /// The effective ordering, ending with the document key.
    pub fn order_by(&self) -> &[OrderBy] {
        &self.order_by
    }

    /// The limit, if any.
    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    /// Which end the limit keeps.
    pub fn limit_type(&self) -> LimitType {
        self.limit_type
    }

    /// The lower cursor.
    pub fn start_at(&self) -> Option<&Bound> {
        self.start_at.as_ref()
    }

    /// The upper cursor.
    pub fn end_at(&self) -> Option<&Bound> {
        self.end_at.as_ref()
    }

    /// True for a limit anchored at the start.
    pub fn has_limit_to_first(&self) -> bool {
        self.limit.is_some() && self.limit_type == LimitType::First
    }

    /// True for a limit anchored at the end.
    pub fn has_limit_to_last(&self) -> bool {
        self.limit.is_some() && self.limit_type == LimitType::Last
    }

    /// The field of the first inequality filter.
    pub fn inequality_filter_field(&self) -> Option<&FieldPath> {
        self.filters.iter().find(|f| f.is_inequality()).map(FieldFilter::field)
    }

    /// The first explicitly ordered field.
    pub fn first_order_by_field(&self) -> Option<&FieldPath> {
        self.explicit_order_by.first().map(|o| &o.field)
    }

    /// True if the query addresses a single document.
    pub fn is_document_query(&self) -> bool {
        DocumentKey::is_document_key(&self.path) && self.collection_group.is_none() && self.filters.is_empty()
    }

    /// True for collection group queries.
    pub fn is_collection_group_query(&self) -> bool {
        self.collection_group.is_some()
    }

    /// True if every document in the collection matches, in key order.
    pub fn matches_all_documents(&self) -> bool {
        self.filters.is_empty()
            && self.limit.is_none()
            && self.start_at.is_none()
            && self.end_at.is_none()
            && (self.explicit_order_by.is_empty()
                || (self.explicit_order_by.len() == 1 && self.explicit_order_by[0].field.is_key_field()))
    }

    /// Evaluates the query against a document, ignoring the limit.
    pub fn matches(&self, doc: &Document) -> bool {
        self.matches_path(doc) && self.matches_order_by(doc) && self.matches_filters(doc) && self.matches_bounds(doc)
    }

    fn matches_path(&self, doc: &Document) -> bool {
        let doc_path = doc.key().path();
        if let Some(group) = &self.collection_group {
            doc.key().has_collection_id(group) && self.path.is_prefix_of(doc_path)
        } else if DocumentKey::is_document_key(&self.path) {
            &self.path == doc_path
        } else {
            self.path.is_immediate_parent_of(doc_path)
        }
    }

    fn matches_order_by(&self, doc: &Document) -> bool {
        self.explicit_order_by
            .iter()
            .filter(|o| !o.field.is_key_field())
            .all(|o| doc.field(&o.field).is_some())
    }

    fn matches_filters(&self, doc: &Document) -> bool {
        self.filters.iter().all(|f| f.matches(doc))
    }

    fn matches_bounds(&self, doc: &Document) -> bool {
        if let Some(start) = &self.start_at {
            if !start.sorts_before_document(&self.order_by, doc) {
                return false;
            }
        }
        if let Some(end) = &self.end_at {
            if end.sorts_before_document(&self.order_by, doc) {
                return false;
            }
        }
        true
    }

    /// Compares two documents in query order.
    pub fn compare_documents(&self, a: &Document, b: &Document) -> Ordering {
        let mut saw_key = false;
        for ordering in &self.order_by {
            let comparison = ordering.compare(a, b);
            if comparison != Ordering::Equal {
                return comparison;
            }
            saw_key |= ordering.field.is_key_field();
        }
        assert!(saw_key, "the effective ordering must include the document key");
        Ordering::Equal
    }

    /// The query ordering as a shareable comparator.
    pub fn comparator(&self) -> Comparator<Document> {
        let query = self.clone();
        Arc::new(move |a: &Document, b: &Document| query.compare_documents(a, b))
    }

    /// Deterministic string form used as a map key.
    pub fn canonical_id(&self) -> String {
        let marker = match self.limit_type {
            LimitType::First => "f",
            LimitType::Last => "l",
        };
        format!("{}|lt:{marker}", self.to_target().canonical_id())
    }

    /// Converts to the backend descriptor.
    ///
    /// A limit-to-last query becomes a limit-to-first target with reversed
    /// ordering and swapped cursors.
    pub fn to_target(&self) -> Target {
        if self.limit_type == LimitType::Last && self.limit.is_some() {
            Target {
                path: self.path.clone(),
                collection_group: self.collection_group.clone(),
                filters: self.filters.clone(),
                order_by: self
                    .order_by
                    .iter()
                    .map(|o| OrderBy::new(o.field.clone(), o.direction.flip()))
                    .collect(),
                limit: self.limit,
                start_at: self.end_at.as_ref().map(Bound::flipped),
                end_at: self.start_at.as_ref().map(Bound::flipped),
            }
        } else {
            Target {
                path: self.path.clone(),
                collection_group: self.collection_group.clone(),
                filters: self.filters.clone(),
                order_by: self.order_by.clone(),
                limit: self.limit,
                start_at: self.start_at.clone(),
                end_at: self.end_at.clone(),
            }
        }
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Query({})", self.canonical_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::DocumentState;
    use crate::value::ObjectValue;
    use crate::version::SnapshotVersion;

    fn field(path: &str) -> FieldPath {
        FieldPath::from_dot_separated(path).unwrap()
    }

    fn doc(path: &str, fields: ObjectValue) -> Document {
        Document::new(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::from_micros(1),
            fields,
            DocumentState::Synced,
        )
    }

    fn collection(path: &str) -> Query {
        Query::at_path(ResourcePath::from_string(path).unwrap())
    }

    #[test]
    fn implicit_ordering() {
        let query = collection("rooms");
        assert_eq!(query.order_by(), &[OrderBy::ascending(FieldPath::key_field())]);

        let filtered = query.with_filter(FieldFilter::create(field("n"), Operator::GreaterThan, 1.into()).unwrap());
        assert_eq!(
            filtered.order_by(),
            &[OrderBy::ascending(field("n")), OrderBy::ascending(FieldPath::key_field())]
        );

        let descending = query.with_order_by(OrderBy::descending(field("n")));
        assert_eq!(descending.order_by()[1], OrderBy::descending(FieldPath::key_field()));
    }

    #[test]
    fn matches_path_and_filters() {
        let query = collection("rooms").with_filter(FieldFilter::create(field("n"), Operator::Equal, 1.into()).unwrap());
        assert!(query.matches(&doc("rooms/a", ObjectValue::from_fields([("n", 1.into())]))));
        assert!(!query.matches(&doc("rooms/a", ObjectValue::from_fields([("n", "1".into())]))));
        assert!(!query.matches(&doc("rooms/a/msgs/b", ObjectValue::from_fields([("n", 1.into())]))));

        let group = Query::collection_group("msgs");
        assert!(group.matches(&doc("rooms/a/msgs/b", ObjectValue::empty())));
        assert!(!group.matches(&doc("rooms/a", ObjectValue::empty())));
    }

    #[test]
    fn order_by_requires_field() {
        let query = collection("rooms").with_order_by(OrderBy::ascending(field("n")));
        assert!(!query.matches(&doc("rooms/a", ObjectValue::empty())));
    }

    #[test]
    fn array_and_in_filters() {
        let tags = ObjectValue::from_fields([("tags", FieldValue::Array(vec!["a".into(), "b".into()]))]);
        let contains = FieldFilter::create(field("tags"), Operator::ArrayContains, "b".into()).unwrap();
        assert!(contains.matches(&doc("c/1", tags.clone())));
        let candidates = FieldValue::Array(vec!["z".into(), "a".into()]);
        let any = FieldFilter::create(field("tags"), Operator::ArrayContainsAny, candidates).unwrap();
        assert!(any.matches(&doc("c/1", tags)));
        let within = FieldFilter::create(field("n"), Operator::In, FieldValue::Array(vec![1.into(), 2.into()])).unwrap();
        assert!(within.matches(&doc("c/1", ObjectValue::from_fields([("n", 2.into())]))));
    }

    #[test]
    fn filter_validation() {
        assert!(FieldFilter::create(field("n"), Operator::LessThan, FieldValue::Null).is_err());
        assert!(FieldFilter::create(field("n"), Operator::GreaterThan, FieldValue::Double(f64::NAN)).is_err());
        assert!(FieldFilter::create(FieldPath::key_field(), Operator::Equal, "x".into()).is_err());
        assert!(FieldFilter::create(field("n"), Operator::In, 1.into()).is_err());
        let key = DocumentKey::from_string("c/1").unwrap();
        let key_filter = FieldFilter::create(FieldPath::key_field(), Operator::Equal, FieldValue::Reference(key)).unwrap();
        assert!(key_filter.matches(&doc("c/1", ObjectValue::empty())));
    }

    #[test]
    fn bounds() {
        let query = collection("c")
            .with_order_by(OrderBy::ascending(field("n")))
            .with_start_at(Bound::new(vec![2.into()], true))
            .with_end_at(Bound::new(vec![4.into()], false));
        let with_n = |n: i64| doc("c/x", ObjectValue::from_fields([("n", n.into())]));
        assert!(!query.matches(&with_n(1)));
        assert!(query.matches(&with_n(2)));
        assert!(query.matches(&with_n(4)));
        assert!(!query.matches(&with_n(5)));
    }

    #[test]
    fn limit_to_last_target_is_reversed() {
        let query = collection("c")
            .with_order_by(OrderBy::ascending(field("n")))
            .with_start_at(Bound::new(vec![1.into()], true))
            .with_limit_to_last(2);
        let target = query.to_target();
        assert_eq!(target.order_by[0], OrderBy::descending(field("n")));
        assert_eq!(target.end_at, Some(Bound::new(vec![1.into()], false)));
        assert!(target.start_at.is_none());
        assert_ne!(query.canonical_id(), query.with_limit_to_first(2).canonical_id());
    }

    #[test]
    fn matches_all_documents() {
        assert!(collection("c").matches_all_documents());
        assert!(collection("c").with_order_by(OrderBy::ascending(FieldPath::key_field())).matches_all_documents());
        assert!(!collection("c").with_limit_to_first(1).matches_all_documents());
        assert!(!collection("c").with_order_by(OrderBy::ascending(field("n"))).matches_all_documents());
    }

    #[test]
    fn comparator_orders_by_field_then_key() {
        let query = collection("c").with_order_by(OrderBy::descending(field("n")));
        let a = doc("c/a", ObjectValue::from_fields([("n", 1.into())]));
        let b = doc("c/b", ObjectValue::from_fields([("n", 2.into())]));
        let c = doc("c/c", ObjectValue::from_fields([("n", 2.into())]));
        assert_eq!(query.compare_documents(&b, &a), Ordering::Less);
        assert_eq!(query.compare_documents(&c, &b), Ordering::Less);
    }

    #[test]
    fn canonical_id_format() {
        let query = collection("c").with_filter(FieldFilter::create(field("n"), Operator::Equal, 1.into()).unwrap());
        assert_eq!(query.to_target().canonical_id(), "c|f:n==1|ob:__name__asc");
        assert_eq!(query.canonical_id(), "c|f:n==1|ob:__name__asc|lt:f");
    }
}
