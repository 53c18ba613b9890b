use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct NewListRequest {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct ItemRequest {
    pub item: String,
}

#[derive(Debug, Serialize)]
pub struct ListsView {
    pub lists: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ListView {
    pub name: String,
    pub items: Vec<String>,
}
