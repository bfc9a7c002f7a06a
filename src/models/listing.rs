use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortBy {
    Name,
    ModifiedAt,
    Size,
}

impl std::fmt::Display for SortBy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Name => write!(f, "name"),
            Self::ModifiedAt => write!(f, "modifiedAt"),
            Self::Size => write!(f, "size"),
        }
    }
}

impl std::str::FromStr for SortBy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "name" => Ok(Self::Name),
            "modifiedAt" => Ok(Self::ModifiedAt),
            "size" => Ok(Self::Size),
            _ => Err(format!("unknown sort field: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortOrder {
    Asc,
    Desc,
}

impl std::fmt::Display for SortOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Asc => write!(f, "asc"),
            Self::Desc => write!(f, "desc"),
        }
    }
}

impl std::str::FromStr for SortOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "asc" => Ok(Self::Asc),
            "desc" => Ok(Self::Desc),
            _ => Err(format!("unknown sort order: {s}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderItem {
    pub path: String,
    pub name: String,
    pub item_count: Option<i64>,
    pub modified_at: Option<String>,
    pub folder_type: Option<String>,
    #[serde(default)]
    pub is_own_folder: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileItem {
    /// `None` for orphaned entries that exist on disk without a record.
    pub id: Option<i64>,
    pub name: String,
    pub size: Option<i64>,
    pub extension: Option<String>,
    pub uploader_name: Option<String>,
    pub modified_at: Option<String>,
    #[serde(default)]
    pub previewable: bool,
    pub download_ref: Option<String>,
    #[serde(default)]
    pub orphaned: bool,
}

/// One page of a directory, replaced wholesale on every successful fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryListing {
    pub path: String,
    pub parent_path: Option<String>,
    pub page: u32,
    pub page_size: u32,
    pub sort_by: SortBy,
    pub sort_order: SortOrder,
    #[serde(default)]
    pub folders: Vec<FolderItem>,
    #[serde(default)]
    pub files: Vec<FileItem>,
    pub total_items: u64,
    pub total_pages: u32,
    #[serde(default)]
    pub has_more: bool,
}

/// Request parameters for the listing endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListingQuery {
    pub path: String,
    pub page: u32,
    pub page_size: u32,
    pub sort_by: SortBy,
    pub sort_order: SortOrder,
}
