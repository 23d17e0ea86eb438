use std::sync::Arc;

use plinth_plugin_sdk::{
    ApiError, HandlerError, Plugin, Reply, RequestExt, Routes, ValidationError,
};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

const MAX_TITLE_LEN: usize = 120;

#[derive(Debug, Clone, Serialize)]
pub struct Note {
    pub id: u64,
    pub title: String,
    pub body: String,
    pub tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct NewNote {
    #[serde(default)]
    title: String,
    #[serde(default)]
    body: String,
    #[serde(default)]
    tags: Vec<String>,
}

impl NewNote {
    fn validate(&self) -> Result<(), ValidationError> {
        let mut errors = ValidationError::new();
        if self.title.trim().is_empty() {
            errors.push("title", "title is required");
        } else if self.title.chars().count() > MAX_TITLE_LEN {
            errors.push(
                "title",
                format!("title must be at most {MAX_TITLE_LEN} characters"),
            );
        }
        for (index, tag) in self.tags.iter().enumerate() {
            if tag.trim().is_empty() {
                errors.push(&format!("tags.{index}"), "tags must not be blank");
            }
        }
        errors.into_result()
    }
}

#[derive(Debug, Default)]
struct Store {
    next_id: u64,
    notes: Vec<Note>,
}

/// Keeps notes in memory for the lifetime of the process.
#[derive(Debug, Default)]
pub struct Notes {
    store: Arc<RwLock<Store>>,
}

fn parse_id(raw: Option<&str>) -> Result<u64, HandlerError> {
    let raw = raw.unwrap_or_default();
    raw.parse().map_err(|_| {
        ValidationError::new()
            .field("id", format!("`{raw}` is not a note id"))
            .into()
    })
}

fn not_found(id: u64) -> HandlerError {
    ApiError::not_found(format!("note {id} does not exist"))
        .with_suggestion("List notes with GET /notes to find valid ids")
        .into()
}

impl Plugin for Notes {
    fn mount(&self, routes: &mut Routes) -> anyhow::Result<()> {
        let store = self.store.clone();
        routes.get("/notes", move |req| {
            let store = store.clone();
            async move {
                let tag = req.query_param("tag");
                let store = store.read().await;
                let notes: Vec<&Note> = store
                    .notes
                    .iter()
                    .filter(|note| tag.as_ref().map_or(true, |tag| note.tags.contains(tag)))
                    .collect();
                Reply::json(&notes)
            }
        });

        let store = self.store.clone();
        routes.post("/notes", move |req| {
            let store = store.clone();
            async move {
                let input: NewNote = req.json()?;
                input.validate()?;
                let mut store = store.write().await;
                store.next_id += 1;
                let note = Note {
                    id: store.next_id,
                    title: input.title.trim().to_string(),
                    body: input.body,
                    tags: input.tags,
                };
                store.notes.push(note.clone());
                Reply::created(&note)
            }
        });

        let store = self.store.clone();
        routes.get("/notes/:id", move |req| {
            let store = store.clone();
            async move {
                let id = parse_id(req.param("id"))?;
                let store = store.read().await;
                let note = store.notes.iter().find(|note| note.id == id);
                note.map_or_else(|| Err(not_found(id)), Reply::json)
            }
        });

        let store = self.store.clone();
        routes.delete("/notes/:id", move |req| {
            let store = store.clone();
            async move {
                let id = parse_id(req.param("id"))?;
                let mut store = store.write().await;
                let Some(index) = store.notes.iter().position(|note| note.id == id) else {
                    return Err(not_found(id));
                };
                let note = store.notes.remove(index);
                Reply::json(&note)
            }
        });
        Ok(())
    }
}
