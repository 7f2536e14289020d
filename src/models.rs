use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// A book as normalized from the external catalog. Never stored as is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Book {
    pub isbn: String,
    pub title: String,
    pub category: String,
    pub language: String,
    pub pub_date: NaiveDate,
    pub authors: Vec<Author>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub name: String,
}
