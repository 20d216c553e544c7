//! Drawing shape model shared by the wire protocol and the storage layer.
//!
//! Three shapes of the same data:
//! - [`ShapeDraft`]: what a client sends with `shape:create` (only `type` is required)
//! - [`ShapeFields`]: the fully-defaulted field set handed to storage
//! - [`ShapePatch`]: a partial update addressed by storage-assigned id
//!
//! Records returned by storage carry the canonical values; broadcasts are
//! always built from those, never from what the client sent.

use serde::{Deserialize, Serialize};

/// Storage-assigned shape identifier.
pub type ShapeId = u64;

/// A single point of a freehand or poly-line shape.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

/// Complete set of persisted shape fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShapeFields {
    /// Shape kind as named by the client (`rect`, `ellipse`, `pencil`, ...)
    #[serde(rename = "type")]
    pub kind: String,
    pub stroke_color: String,
    pub fill_color: String,
    pub stroke_width: f64,
    pub stroke_style: String,
    pub fill_style: String,
    pub points: Vec<Point>,
    pub text: String,
    pub font_size: f64,
    pub start_x: f64,
    pub start_y: f64,
    pub width: f64,
    pub height: f64,
}

impl ShapeFields {
    /// Fields for a shape of the given kind with every style at its default.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            stroke_color: "black".to_string(),
            fill_color: "transparent".to_string(),
            stroke_width: 1.0,
            stroke_style: "solid".to_string(),
            fill_style: "solid".to_string(),
            points: Vec::new(),
            text: String::new(),
            font_size: 12.0,
            start_x: 0.0,
            start_y: 0.0,
            width: 0.0,
            height: 0.0,
        }
    }

    /// Overwrite every field the patch carries; absent fields are untouched.
    pub fn apply(&mut self, patch: &ShapePatch) {
        if let Some(kind) = &patch.kind {
            self.kind.clone_from(kind);
        }
        if let Some(v) = &patch.stroke_color {
            self.stroke_color.clone_from(v);
        }
        if let Some(v) = &patch.fill_color {
            self.fill_color.clone_from(v);
        }
        if let Some(v) = patch.stroke_width {
            self.stroke_width = v;
        }
        if let Some(v) = &patch.stroke_style {
            self.stroke_style.clone_from(v);
        }
        if let Some(v) = &patch.fill_style {
            self.fill_style.clone_from(v);
        }
        if let Some(v) = &patch.points {
            self.points.clone_from(v);
        }
        if let Some(v) = &patch.text {
            self.text.clone_from(v);
        }
        if let Some(v) = patch.font_size {
            self.font_size = v;
        }
        if let Some(v) = patch.start_x {
            self.start_x = v;
        }
        if let Some(v) = patch.start_y {
            self.start_y = v;
        }
        if let Some(v) = patch.width {
            self.width = v;
        }
        if let Some(v) = patch.height {
            self.height = v;
        }
    }
}

/// Client-side description of a new shape.
///
/// Any `id` the client attaches (a local placeholder) is ignored.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShapeDraft {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub stroke_color: Option<String>,
    #[serde(default)]
    pub fill_color: Option<String>,
    #[serde(default)]
    pub stroke_width: Option<f64>,
    #[serde(default)]
    pub stroke_style: Option<String>,
    #[serde(default)]
    pub fill_style: Option<String>,
    #[serde(default)]
    pub points: Option<Vec<Point>>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub font_size: Option<f64>,
    #[serde(default)]
    pub start_x: Option<f64>,
    #[serde(default)]
    pub start_y: Option<f64>,
    #[serde(default)]
    pub width: Option<f64>,
    #[serde(default)]
    pub height: Option<f64>,
}

impl ShapeDraft {
    /// Resolve the draft into a complete field set, filling defaults.
    pub fn into_fields(self) -> ShapeFields {
        let defaults = ShapeFields::new(self.kind);
        ShapeFields {
            stroke_color: self.stroke_color.unwrap_or(defaults.stroke_color),
            fill_color: self.fill_color.unwrap_or(defaults.fill_color),
            stroke_width: self.stroke_width.unwrap_or(defaults.stroke_width),
            stroke_style: self.stroke_style.unwrap_or(defaults.stroke_style),
            fill_style: self.fill_style.unwrap_or(defaults.fill_style),
            points: self.points.unwrap_or(defaults.points),
            text: self.text.unwrap_or(defaults.text),
            font_size: self.font_size.unwrap_or(defaults.font_size),
            start_x: self.start_x.unwrap_or(defaults.start_x),
            start_y: self.start_y.unwrap_or(defaults.start_y),
            width: self.width.unwrap_or(defaults.width),
            height: self.height.unwrap_or(defaults.height),
            kind: defaults.kind,
        }
    }
}

/// Partial update of an existing shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShapePatch {
    pub id: ShapeId,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub stroke_color: Option<String>,
    #[serde(default)]
    pub fill_color: Option<String>,
    #[serde(default)]
    pub stroke_width: Option<f64>,
    #[serde(default)]
    pub stroke_style: Option<String>,
    #[serde(default)]
    pub fill_style: Option<String>,
    #[serde(default)]
    pub points: Option<Vec<Point>>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub font_size: Option<f64>,
    #[serde(default)]
    pub start_x: Option<f64>,
    #[serde(default)]
    pub start_y: Option<f64>,
    #[serde(default)]
    pub width: Option<f64>,
    #[serde(default)]
    pub height: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_draft_fills_defaults() {
        let draft: ShapeDraft = serde_json::from_str(r#"{"type":"rect","width":40}"#).unwrap();
        let fields = draft.into_fields();

        assert_eq!(fields.kind, "rect");
        assert_eq!(fields.width, 40.0);
        assert_eq!(fields.stroke_color, "black");
        assert_eq!(fields.fill_color, "transparent");
        assert_eq!(fields.stroke_width, 1.0);
        assert_eq!(fields.font_size, 12.0);
        assert!(fields.points.is_empty());
    }

    #[test]
    fn test_draft_ignores_client_placeholder_id() {
        let draft: ShapeDraft =
            serde_json::from_str(r#"{"id":"tmp-17","type":"ellipse"}"#).unwrap();
        assert_eq!(draft.kind, "ellipse");
    }

    #[test]
    fn test_draft_requires_type() {
        let result: Result<ShapeDraft, _> = serde_json::from_str(r#"{"width":10}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_patch_only_touches_present_fields() {
        let mut fields = ShapeFields::new("line");
        fields.start_x = 5.0;
        fields.stroke_color = "red".into();

        let patch: ShapePatch =
            serde_json::from_str(r#"{"id":9,"startY":12.5,"points":[{"x":1,"y":2}]}"#).unwrap();
        fields.apply(&patch);

        assert_eq!(fields.start_x, 5.0);
        assert_eq!(fields.start_y, 12.5);
        assert_eq!(fields.stroke_color, "red");
        assert_eq!(fields.points, vec![Point { x: 1.0, y: 2.0 }]);
        assert_eq!(fields.kind, "line");
    }

    #[test]
    fn test_patch_requires_id() {
        let result: Result<ShapePatch, _> = serde_json::from_str(r#"{"width":10}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_fields_serialize_camel_case() {
        let json = serde_json::to_value(ShapeFields::new("text")).unwrap();
        assert_eq!(json["type"], "text");
        assert_eq!(json["strokeColor"], "black");
        assert_eq!(json["fontSize"], 12.0);
        assert!(json.get("stroke_color").is_none());
    }
}
