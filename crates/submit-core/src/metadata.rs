use serde_json::Value;

pub const DEFAULT_PRICE: u32 = 37;
pub const DEFAULT_LICENSE: &str = "Royalty free";
pub const DEFAULT_POLYGONS: u64 = 100_000;

const MAX_TAGS: usize = 15;
const MIN_PRICE: i64 = 5;
const MAX_PRICE: i64 = 999;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Category {
    #[default]
    Character,
    Vehicle,
    Architecture,
    Aircraft,
    Animal,
    Plant,
    Furniture,
    Electronics,
    Weapon,
    Food,
    Sport,
    Various,
}

impl Category {
    pub const ALL: [Category; 12] = [
        Category::Character,
        Category::Vehicle,
        Category::Architecture,
        Category::Aircraft,
        Category::Animal,
        Category::Plant,
        Category::Furniture,
        Category::Electronics,
        Category::Weapon,
        Category::Food,
        Category::Sport,
        Category::Various,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Character => "Character",
            Category::Vehicle => "Vehicle",
            Category::Architecture => "Architecture",
            Category::Aircraft => "Aircraft",
            Category::Animal => "Animal",
            Category::Plant => "Plant",
            Category::Furniture => "Furniture",
            Category::Electronics => "Electronics",
            Category::Weapon => "Weapon",
            Category::Food => "Food",
            Category::Sport => "Sport",
            Category::Various => "Various",
        }
    }

    pub fn parse(raw: &str) -> Option<Category> {
        let raw = raw.trim();
        Category::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(raw))
    }

    pub fn default_subcategory(self) -> &'static str {
        match self {
            Category::Character => "Man",
            Category::Vehicle => "Car",
            Category::Architecture => "Building",
            Category::Aircraft => "Airplane",
            Category::Animal => "Mammal",
            Category::Plant => "Tree",
            Category::Furniture => "Chair",
            Category::Electronics => "Computer",
            Category::Weapon => "Gun",
            Category::Food => "Fruit",
            Category::Sport => "Ball",
            Category::Various => "Other",
        }
    }
}

/// Listing metadata attached to a task once the analyze stage has run.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ModelMetadata {
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
    pub category: Category,
    pub subcategory: String,
    pub is_human: bool,
    pub is_rigged: bool,
    pub has_textures: bool,
    pub price: u32,
    pub polygons: u64,
    pub vertices: u64,
    pub geometry: String,
    pub unwrapped_uvs: bool,
    pub non_overlapping: bool,
    pub ai_generated: bool,
    pub license: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview_image: Option<String>,
}

impl Default for ModelMetadata {
    fn default() -> Self {
        Self {
            title: "3D Character Model".to_string(),
            description: "High-quality 3D character model with detailed textures. \
                Perfect for games, animations, and visualization projects. \
                Includes multiple file formats for easy integration."
                .to_string(),
            tags: [
                "character",
                "3d-model",
                "game-ready",
                "pbr",
                "textured",
                "low-poly",
                "human",
                "man",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
            category: Category::Character,
            subcategory: Category::Character.default_subcategory().to_string(),
            is_human: true,
            is_rigged: false,
            has_textures: true,
            price: DEFAULT_PRICE,
            polygons: DEFAULT_POLYGONS,
            vertices: DEFAULT_POLYGONS,
            geometry: "Polygon mesh".to_string(),
            unwrapped_uvs: true,
            non_overlapping: true,
            ai_generated: false,
            license: DEFAULT_LICENSE.to_string(),
            preview_image: None,
        }
    }
}

fn non_empty_str<'a>(obj: &'a Value, key: &str) -> Option<&'a str> {
    obj.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

pub fn normalize_tag(raw: &str) -> String {
    raw.trim().to_lowercase().replace([' ', '_'], "-")
}

impl ModelMetadata {
    /// Builds a record from the loosely-shaped JSON object a vision model
    /// returns, filling every missing or invalid field with its default.
    pub fn from_loose_json(raw: &Value) -> ModelMetadata {
        let mut out = ModelMetadata {
            title: "3D Model".to_string(),
            description: "High-quality 3D model ready for use in games, visualization, \
                and animation projects."
                .to_string(),
            tags: vec![
                "3d-model".to_string(),
                "game-ready".to_string(),
                "pbr".to_string(),
            ],
            ..ModelMetadata::default()
        };

        if let Some(title) = non_empty_str(raw, "title") {
            out.title = title.to_string();
        }
        if let Some(description) = non_empty_str(raw, "description") {
            out.description = description.to_string();
        }
        if let Some(tags) = raw.get("tags").and_then(Value::as_array) {
            out.tags = tags
                .iter()
                .filter_map(Value::as_str)
                .filter(|t| t.trim().chars().count() > 1)
                .map(normalize_tag)
                .take(MAX_TAGS)
                .collect();
        }

        out.category = non_empty_str(raw, "category")
            .and_then(Category::parse)
            .unwrap_or_default();
        out.subcategory = non_empty_str(raw, "subcategory")
            .unwrap_or(out.category.default_subcategory())
            .to_string();

        let price = raw
            .get("suggested_price")
            .or_else(|| raw.get("price"))
            .and_then(|v| match v {
                Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
                Value::String(s) => s.trim().parse::<i64>().ok(),
                _ => None,
            });
        out.price = match price {
            Some(p) => p.clamp(MIN_PRICE, MAX_PRICE) as u32,
            None => DEFAULT_PRICE,
        };

        if let Some(v) = raw.get("is_human").and_then(Value::as_bool) {
            out.is_human = v;
        }
        if let Some(v) = raw.get("is_rigged").and_then(Value::as_bool) {
            out.is_rigged = v;
        }
        if let Some(v) = raw.get("has_textures").and_then(Value::as_bool) {
            out.has_textures = v;
        }

        out
    }
}
