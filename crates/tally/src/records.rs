//! 📦 Records: the people and the groups they reluctantly belong to.
//!
//! 🎬 COLD OPEN. INT. HR DEPARTMENT, A FLUORESCENT HUM
//!
//! Somebody needs a million and a half people and five thousand groups.
//! Nobody wants to type them. So we make them up, hand them to the store,
//! and forget them the moment the store says "got it". No local copies.
//! No sentimental attachment. Immutable once born.
//!
//! This module defines what those made-up things look like on the wire.
//! The field names are the index mapping's field names, verbatim, because
//! the aggregation queries reach for `person_list.age` and friends by name. 🦆

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// 🪪 Anything the bulk loader can ship: it must know its own id and serialize itself.
pub trait Document: Serialize {
    /// The identifier the store will file this document under.
    fn doc_id(&self) -> &str;
}

/// 🧍 One synthetic person. Lives in the `person` collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonRecord {
    pub id: String,
    pub name: String,
    pub age: i64,
    pub birthday: NaiveDate,
    pub region: String,
    pub rep_office: i64,
    pub rep: i64,
}

impl Document for PersonRecord {
    fn doc_id(&self) -> &str {
        &self.id
    }
}

/// 👥 A member reference inside a group, with the person's scalars cached alongside.
///
/// The cache is what makes the nested aggregation work: the group index has no
/// join to `person`, so `age` and `birthday` ride along inside `person_list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub id: String,
    pub name: String,
    pub age: i64,
    pub birthday: NaiveDate,
}

impl From<&PersonRecord> for Member {
    fn from(person: &PersonRecord) -> Self {
        Self {
            id: person.id.clone(),
            name: person.name.clone(),
            age: person.age,
            birthday: person.birthday,
        }
    }
}

impl From<PersonRecord> for Member {
    fn from(person: PersonRecord) -> Self {
        Self {
            id: person.id,
            name: person.name,
            age: person.age,
            birthday: person.birthday,
        }
    }
}

/// 🏢 One synthetic group. Lives in the `group` collection, `person_list` is a nested field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupRecord {
    pub group_id: String,
    pub group_name: String,
    pub person_list: Vec<Member>,
}

impl Document for GroupRecord {
    fn doc_id(&self) -> &str {
        &self.group_id
    }
}

/// 🗺️ Index mapping for the `person` collection.
pub fn person_mapping() -> serde_json::Value {
    serde_json::json!({
        "mappings": {
            "properties": {
                "id": {"type": "keyword"},
                "name": {"type": "text"},
                "age": {"type": "integer"},
                "birthday": {"type": "date"},
                "region": {"type": "keyword"},
                "rep_office": {"type": "integer"},
                "rep": {"type": "integer"}
            }
        }
    })
}

/// 🗺️ Index mapping for the `group` collection. `person_list` must be nested or the
/// per-member predicates would match across different members of the same group.
pub fn group_mapping() -> serde_json::Value {
    serde_json::json!({
        "mappings": {
            "properties": {
                "group_id": {"type": "keyword"},
                "group_name": {"type": "text"},
                "person_list": {
                    "type": "nested",
                    "properties": {
                        "id": {"type": "keyword"},
                        "age": {"type": "integer"},
                        "name": {"type": "text"},
                        "birthday": {"type": "date"}
                    }
                }
            }
        }
    })
}
