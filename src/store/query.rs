use crate::string::SmallString;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use utoipa::IntoParams;

/// Region parameters accepted by element-returning endpoints. Spatial bounds
/// are in base layer pixels; an element is included when its bounding box
/// intersects the requested area.
#[derive(Debug, Default, Clone, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct RegionParams {
    pub left: Option<f64>,
    pub right: Option<f64>,
    pub top: Option<f64>,
    pub bottom: Option<f64>,
    pub low: Option<f64>,
    pub high: Option<f64>,
    /// Only elements whose bbox diagonal is at least this long are returned.
    pub minimum_size: Option<f64>,
    /// `size`, `details`, `created` or `id`; unknown keys sort by id.
    pub sort: Option<String>,
    /// 1 for ascending (the default), -1 for descending.
    pub sortdir: Option<i32>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    /// Stop once the cumulative `bbox.details` of returned elements reaches
    /// this value. Applied in addition to `limit`.
    pub max_details: Option<i64>,
    /// Return the compact binary centroid form instead of full elements.
    pub centroids: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    Id,
    Created,
    Size,
    Details,
}

impl SortKey {
    fn name(self) -> &'static str {
        match self {
            Self::Id => "id",
            Self::Created => "created",
            Self::Size => "size",
            Self::Details => "details",
        }
    }
}

/// A translated region query: the concrete cursor plan the element store
/// executes for one `(annotationId, version)` snapshot.
#[derive(Debug, Clone)]
pub struct ElementQueryPlan {
    pub logical_id: SmallString,
    pub version: i64,
    pub min_highx: Option<f64>,
    pub max_lowx: Option<f64>,
    pub min_highy: Option<f64>,
    pub max_lowy: Option<f64>,
    pub min_highz: Option<f64>,
    pub max_lowz: Option<f64>,
    pub min_size: Option<f64>,
    pub sort: SortKey,
    pub descending: bool,
    pub limit: Option<i64>,
    pub offset: i64,
    pub max_details: Option<i64>,
    pub centroids: bool,
}

impl ElementQueryPlan {
    pub fn new(logical_id: SmallString, version: i64, region: &RegionParams) -> Self {
        // Lower-bound comparisons with a non-positive threshold are vacuous
        // (every bbox intersects them), so those constraints are dropped.
        let positive = |value: Option<f64>| value.filter(|&threshold| threshold > 0.0);
        Self {
            logical_id,
            version,
            min_highx: positive(region.left),
            max_lowx: region.right,
            min_highy: positive(region.top),
            max_lowy: region.bottom,
            min_highz: positive(region.low),
            max_lowz: region.high,
            min_size: positive(region.minimum_size),
            sort: match region.sort.as_deref() {
                Some("size") => SortKey::Size,
                Some("details") => SortKey::Details,
                Some("created") => SortKey::Created,
                _ => SortKey::Id,
            },
            descending: region.sortdir == Some(-1),
            limit: region.limit.filter(|&limit| limit > 0),
            offset: region.offset.unwrap_or(0).max(0),
            max_details: region.max_details.filter(|&details| details > 0),
            centroids: region.centroids.unwrap_or(false),
        }
    }

    /// The row cap passed to the database: `maxDetails` bounds the row count
    /// from above too, since every element has `details >= 1`.
    pub fn query_limit(&self) -> Option<i64> {
        match (self.limit, self.max_details) {
            (None, max_details) => max_details,
            (limit, None) => limit,
            (Some(limit), Some(max_details)) => Some(limit.min(max_details)),
        }
    }

    pub fn filter_description(&self) -> Value {
        let mut filter = json!({
            "annotationId": self.logical_id.as_ref(),
            "version": self.version,
        });
        let bounds = [
            ("highx", json!({"$gte": self.min_highx}), self.min_highx.is_some()),
            ("lowx", json!({"$lt": self.max_lowx}), self.max_lowx.is_some()),
            ("highy", json!({"$gte": self.min_highy}), self.min_highy.is_some()),
            ("lowy", json!({"$lt": self.max_lowy}), self.max_lowy.is_some()),
            ("highz", json!({"$gte": self.min_highz}), self.min_highz.is_some()),
            ("lowz", json!({"$lt": self.max_lowz}), self.max_lowz.is_some()),
            ("size", json!({"$gte": self.min_size}), self.min_size.is_some()),
        ];
        if let Some(map) = filter.as_object_mut() {
            for (key, description, present) in bounds {
                if present {
                    map.insert(format!("bbox.{key}"), description);
                }
            }
        }
        filter
    }

    pub fn sort_description(&self) -> Value {
        json!([self.sort.name(), if self.descending { -1 } else { 1 }])
    }
}

/// The `_elementQuery` side channel returned alongside element results.
#[derive(Debug, Default, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryInfo {
    pub count: i64,
    pub offset: i64,
    pub filter: Value,
    pub sort: Value,
    pub returned: i64,
    pub details: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_details: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub centroids: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub props: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub propskeys: Option<Vec<&'static str>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(region: RegionParams) -> ElementQueryPlan {
        ElementQueryPlan::new(SmallString::new("0123456789abcdef01234567"), 7, &region)
    }

    #[test]
    fn translates_bounds_half_open() {
        let built = plan(RegionParams {
            left: Some(3000.0),
            right: Some(4000.0),
            top: Some(4500.0),
            bottom: Some(6500.0),
            ..Default::default()
        });
        assert_eq!(built.min_highx, Some(3000.0));
        assert_eq!(built.max_lowx, Some(4000.0));
        assert_eq!(built.min_highy, Some(4500.0));
        assert_eq!(built.max_lowy, Some(6500.0));
        assert_eq!(built.min_highz, None);
        assert_eq!(built.max_lowz, None);
    }

    #[test]
    fn drops_vacuous_lower_bounds() {
        let built = plan(RegionParams {
            left: Some(0.0),
            top: Some(-25.0),
            minimum_size: Some(0.0),
            bottom: Some(0.0),
            ..Default::default()
        });
        assert_eq!(built.min_highx, None);
        assert_eq!(built.min_highy, None);
        assert_eq!(built.min_size, None);
        // Upper bounds keep zero thresholds; they are real constraints.
        assert_eq!(built.max_lowy, Some(0.0));
    }

    #[test]
    fn effective_limit_is_the_tighter_of_limit_and_max_details() {
        let both = plan(RegionParams {
            limit: Some(500),
            max_details: Some(300),
            ..Default::default()
        });
        assert_eq!(both.query_limit(), Some(300));

        let loose = plan(RegionParams {
            limit: Some(100),
            max_details: Some(300),
            ..Default::default()
        });
        assert_eq!(loose.query_limit(), Some(100));

        let only_details = plan(RegionParams {
            max_details: Some(300),
            ..Default::default()
        });
        assert_eq!(only_details.query_limit(), Some(300));
        assert_eq!(plan(RegionParams::default()).query_limit(), None);
    }

    #[test]
    fn unknown_sort_keys_fall_back_to_id() {
        let by_size = plan(RegionParams {
            sort: Some(String::from("size")),
            sortdir: Some(-1),
            ..Default::default()
        });
        assert_eq!(by_size.sort, SortKey::Size);
        assert!(by_size.descending);
        assert_eq!(by_size.sort_description(), json!(["size", -1]));

        let unknown = plan(RegionParams {
            sort: Some(String::from("flavor")),
            ..Default::default()
        });
        assert_eq!(unknown.sort, SortKey::Id);
        assert!(!unknown.descending);
    }

    #[test]
    fn filter_description_reflects_constraints() {
        let built = plan(RegionParams {
            left: Some(10.0),
            minimum_size: Some(16.0),
            ..Default::default()
        });
        let filter = built.filter_description();
        assert_eq!(filter["annotationId"], "0123456789abcdef01234567");
        assert_eq!(filter["version"], 7);
        assert_eq!(filter["bbox.highx"]["$gte"], 10.0);
        assert_eq!(filter["bbox.size"]["$gte"], 16.0);
        assert!(filter.get("bbox.lowx").is_none());
    }
}
