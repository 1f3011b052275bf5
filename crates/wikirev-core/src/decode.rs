//! Streaming decoder for Action API query responses.
//!
//! The body is consumed incrementally through serde's visitor machinery:
//! each revision is handed to the sink as soon as its object closes, so a
//! page of fifty article texts is never held as one parsed document.
//! Revisions without text wait for their page to close, where a TextExtracts
//! `extract` field (latest mode) becomes the newest one's content.

use std::fmt;
use std::io::Read;

use chrono::{DateTime, Utc};
use serde::de::{self, DeserializeSeed, Deserializer, IgnoredAny, MapAccess, SeqAccess, Visitor};
use serde::Deserialize;

use crate::model::{ContinuationToken, RevisionRecord};

/// `{"error": {"code": ..., "info": ...}}` delivered with HTTP 200
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ApiError {
    pub code: String,
    #[serde(default)]
    pub info: String,
}

/// Per-page facts, reported once the page object has been fully read
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageSummary {
    pub page_id: Option<u64>,
    pub title: Option<String>,
    pub missing: bool,
    pub invalid: bool,
    /// Revisions carried by this page in this response
    pub revisions: usize,
}

/// Items surfaced while the body is still being read
#[derive(Debug)]
pub enum DecodeEvent<'a> {
    /// Requested title `from` is known to the wiki as `to`
    Normalized { from: &'a str, to: &'a str },
    Revision {
        page_id: Option<u64>,
        title: Option<&'a str>,
        record: RevisionRecord,
    },
    Page(&'a PageSummary),
}

/// Everything in the response that is not streamed to the sink
#[derive(Debug, Default)]
pub struct FetchResponse {
    pub continuation: Option<ContinuationToken>,
    pub api_error: Option<ApiError>,
    pub revisions: usize,
    pub pages: usize,
}

/// REST `history/counts/edits` body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct EditCount {
    pub count: u64,
    /// Server stopped counting; `count` is a lower bound only
    #[serde(default)]
    pub limit: bool,
}

type Sink<'s> = dyn FnMut(DecodeEvent<'_>) + 's;

/// Decode one query response, pushing revisions into `sink` as they arrive.
///
/// Fails on truncated or syntactically invalid bodies and on trailing data;
/// revisions already pushed before the failure are the caller's to discard.
pub fn decode_query<R, F>(reader: R, mut sink: F) -> Result<FetchResponse, serde_json::Error>
where
    R: Read,
    F: FnMut(DecodeEvent<'_>),
{
    let mut revisions = 0;
    let mut pages = 0;
    let mut response = {
        let mut counting = |event: DecodeEvent<'_>| {
            match &event {
                DecodeEvent::Revision { .. } => revisions += 1,
                DecodeEvent::Page(_) => pages += 1,
                DecodeEvent::Normalized { .. } => {}
            }
            sink(event);
        };
        let mut de = serde_json::Deserializer::from_reader(reader);
        let response = ResponseSeed { sink: &mut counting }.deserialize(&mut de)?;
        de.end()?;
        response
    };
    response.revisions = revisions;
    response.pages = pages;
    Ok(response)
}

pub fn decode_edit_count<R: Read>(reader: R) -> Result<EditCount, serde_json::Error> {
    serde_json::from_reader(reader)
}

#[derive(Deserialize)]
#[serde(field_identifier, rename_all = "lowercase")]
enum TopField {
    Continue,
    Query,
    Error,
    #[serde(other)]
    Other,
}

struct ResponseSeed<'s, 'f> {
    sink: &'s mut Sink<'f>,
}

impl<'de> DeserializeSeed<'de> for ResponseSeed<'_, '_> {
    type Value = FetchResponse;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<Self::Value, D::Error> {
        deserializer.deserialize_map(self)
    }
}

impl<'de> Visitor<'de> for ResponseSeed<'_, '_> {
    type Value = FetchResponse;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a query response object")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
        let mut response = FetchResponse::default();
        while let Some(key) = map.next_key::<TopField>()? {
            match key {
                TopField::Continue => response.continuation = Some(map.next_value()?),
                TopField::Query => map.next_value_seed(QuerySeed {
                    sink: &mut *self.sink,
                })?,
                TopField::Error => response.api_error = Some(map.next_value()?),
                TopField::Other => {
                    map.next_value::<IgnoredAny>()?;
                }
            }
        }
        Ok(response)
    }
}

#[derive(Deserialize)]
#[serde(field_identifier, rename_all = "lowercase")]
enum QueryField {
    Normalized,
    Pages,
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct Normalization {
    from: String,
    to: String,
}

struct QuerySeed<'s, 'f> {
    sink: &'s mut Sink<'f>,
}

impl<'de> DeserializeSeed<'de> for QuerySeed<'_, '_> {
    type Value = ();

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<(), D::Error> {
        deserializer.deserialize_map(self)
    }
}

impl<'de> Visitor<'de> for QuerySeed<'_, '_> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a query object")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<(), A::Error> {
        while let Some(key) = map.next_key::<QueryField>()? {
            match key {
                QueryField::Normalized => {
                    for n in map.next_value::<Vec<Normalization>>()? {
                        (self.sink)(DecodeEvent::Normalized {
                            from: &n.from,
                            to: &n.to,
                        });
                    }
                }
                QueryField::Pages => map.next_value_seed(PagesSeed {
                    sink: &mut *self.sink,
                })?,
                QueryField::Other => {
                    map.next_value::<IgnoredAny>()?;
                }
            }
        }
        Ok(())
    }
}

/// `pages` is an array in formatversion 2 and an id-keyed object in 1
struct PagesSeed<'s, 'f> {
    sink: &'s mut Sink<'f>,
}

impl<'de> DeserializeSeed<'de> for PagesSeed<'_, '_> {
    type Value = ();

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<(), D::Error> {
        deserializer.deserialize_any(self)
    }
}

impl<'de> Visitor<'de> for PagesSeed<'_, '_> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a list or map of pages")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<(), A::Error> {
        while seq
            .next_element_seed(PageSeed {
                sink: &mut *self.sink,
            })?
            .is_some()
        {}
        Ok(())
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<(), A::Error> {
        while map.next_key::<IgnoredAny>()?.is_some() {
            map.next_value_seed(PageSeed {
                sink: &mut *self.sink,
            })?;
        }
        Ok(())
    }
}

#[derive(Deserialize)]
#[serde(field_identifier, rename_all = "lowercase")]
enum PageField {
    PageId,
    Title,
    Missing,
    Invalid,
    Revisions,
    Extract,
    #[serde(other)]
    Other,
}

struct PageSeed<'s, 'f> {
    sink: &'s mut Sink<'f>,
}

impl<'de> DeserializeSeed<'de> for PageSeed<'_, '_> {
    type Value = ();

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<(), D::Error> {
        deserializer.deserialize_map(self)
    }
}

impl<'de> Visitor<'de> for PageSeed<'_, '_> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a page object")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<(), A::Error> {
        let sink = self.sink;
        let mut page = PageSummary::default();
        // Held until the page closes: revisions seen before the title, and
        // revisions without text, which a page-level extract may fill
        let mut held: Vec<RevisionRecord> = Vec::new();
        let mut extract: Option<String> = None;

        while let Some(key) = map.next_key::<PageField>()? {
            match key {
                PageField::PageId => page.page_id = Some(map.next_value()?),
                PageField::Title => page.title = Some(map.next_value()?),
                // `true` in formatversion 2, `""` in 1: presence is the flag
                PageField::Missing => {
                    map.next_value::<IgnoredAny>()?;
                    page.missing = true;
                }
                PageField::Invalid => {
                    map.next_value::<IgnoredAny>()?;
                    page.invalid = true;
                }
                PageField::Revisions => {
                    let page_id = page.page_id;
                    let title = page.title.as_deref();
                    let count = &mut page.revisions;
                    let held = &mut held;
                    let sink = &mut *sink;
                    map.next_value_seed(RevisionsSeed {
                        on_record: &mut |record: RevisionRecord| {
                            *count += 1;
                            if title.is_some() && record.content.is_some() {
                                sink(DecodeEvent::Revision {
                                    page_id,
                                    title,
                                    record,
                                });
                            } else {
                                held.push(record);
                            }
                        },
                    })?;
                }
                PageField::Extract => extract = Some(map.next_value()?),
                PageField::Other => {
                    map.next_value::<IgnoredAny>()?;
                }
            }
        }

        if let Some(text) = extract {
            if let Some(latest) = held
                .iter_mut()
                .filter(|r| r.content.is_none())
                .max_by_key(|r| r.revid)
            {
                latest.content = Some(text);
            }
        }
        for record in held {
            sink(DecodeEvent::Revision {
                page_id: page.page_id,
                title: page.title.as_deref(),
                record,
            });
        }
        sink(DecodeEvent::Page(&page));
        Ok(())
    }
}

struct RevisionsSeed<'r> {
    on_record: &'r mut dyn FnMut(RevisionRecord),
}

impl<'de> DeserializeSeed<'de> for RevisionsSeed<'_> {
    type Value = ();

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<(), D::Error> {
        deserializer.deserialize_seq(self)
    }
}

impl<'de> Visitor<'de> for RevisionsSeed<'_> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a list of revisions")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<(), A::Error> {
        while let Some(raw) = seq.next_element::<RawRevision>()? {
            let record = raw.into_record().map_err(de::Error::custom)?;
            (self.on_record)(record);
        }
        Ok(())
    }
}

#[derive(Deserialize)]
struct RawRevision {
    revid: u64,
    #[serde(default)]
    parentid: Option<u64>,
    timestamp: String,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    userid: Option<u64>,
    #[serde(default)]
    slots: Option<RawSlots>,
    /// Content without `rvslots` (formatversion 2)
    #[serde(default)]
    content: Option<String>,
    /// Content without `rvslots` (formatversion 1)
    #[serde(default, rename = "*")]
    legacy_content: Option<String>,
}

#[derive(Deserialize)]
struct RawSlots {
    #[serde(default)]
    main: Option<RawSlot>,
}

#[derive(Deserialize)]
struct RawSlot {
    /// Absent when the text is suppressed (`texthidden`)
    #[serde(default)]
    content: Option<String>,
    #[serde(default, rename = "*")]
    legacy_content: Option<String>,
}

impl RawRevision {
    fn into_record(self) -> Result<RevisionRecord, String> {
        let timestamp = DateTime::parse_from_rfc3339(&self.timestamp)
            .map_err(|e| format!("revision {}: bad timestamp {:?}: {e}", self.revid, self.timestamp))?
            .with_timezone(&Utc);
        let content = match self.slots.and_then(|s| s.main) {
            Some(slot) => slot.content.or(slot.legacy_content),
            None => self.content.or(self.legacy_content),
        };
        Ok(RevisionRecord {
            revid: self.revid,
            // Page creations report parentid 0
            parent_id: self.parentid.filter(|&p| p != 0),
            timestamp,
            user: self.user,
            user_id: self.userid,
            content,
        })
    }
}
