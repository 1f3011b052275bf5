//! Output writers for verified histories: one file per article

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::SecondsFormat;
use clap::ValueEnum;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use serde::{Deserialize, Serialize};

use wikirev_core::{CompletedHistory, OutcomeSink, RevisionRecord};

const EXPORT_NS: &str = "http://www.mediawiki.org/xml/export-0.10/";
const EXPORT_SCHEMA: &str =
    "http://www.mediawiki.org/xml/export-0.10/ http://www.mediawiki.org/xml/export-0.10.xsd";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// `[{revid, timestamp, user, content}, ...]`, unix timestamps
    #[default]
    Json,
    /// MediaWiki export-0.10 document
    Xml,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Xml => "xml",
        }
    }
}

/// File name suffix for cleaned histories, written next to the raw file
pub const CLEAN_SUFFIX: &str = "_clean";

/// Build the sink for `format`, writing into `dir` with `suffix` after the lang
pub fn sink_for(format: OutputFormat, dir: &Path, lang: &str, suffix: &str) -> Box<dyn OutcomeSink> {
    match format {
        OutputFormat::Json => Box::new(JsonSink::new(dir, lang).with_suffix(suffix)),
        OutputFormat::Xml => Box::new(XmlSink::new(dir, lang).with_suffix(suffix)),
    }
}

/// Directory, language and file-name suffix shared by both writers
struct FileNaming {
    dir: PathBuf,
    lang: String,
    suffix: String,
}

impl FileNaming {
    fn new(dir: &Path, lang: &str) -> Self {
        Self {
            dir: dir.to_path_buf(),
            lang: lang.to_string(),
            suffix: String::new(),
        }
    }

    /// `{dir}/{title}_{lang}{suffix}.{ext}`
    fn path(&self, history: &CompletedHistory, ext: &str) -> PathBuf {
        self.dir.join(format!(
            "{}_{}{}.{ext}",
            history.target.file_stem(),
            self.lang,
            self.suffix
        ))
    }
}

/// Write through `{path}.tmp`, renamed into place once complete
fn write_atomic<F>(path: &Path, write: F) -> io::Result<()>
where
    F: FnOnce(&mut BufWriter<File>) -> io::Result<()>,
{
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);
    if tmp_path.exists() {
        fs::remove_file(&tmp_path)?;
    }

    let mut writer = BufWriter::new(File::create(&tmp_path)?);
    write(&mut writer)?;
    writer.flush()?;
    writer.into_inner().map_err(|e| e.into_error())?.sync_all()?;

    fs::rename(&tmp_path, path)?;
    log::debug!("Wrote {}", path.display());
    Ok(())
}

#[derive(Serialize)]
struct JsonRevision<'a> {
    revid: u64,
    timestamp: i64,
    user: Option<&'a str>,
    content: Option<&'a str>,
}

impl<'a> From<&'a RevisionRecord> for JsonRevision<'a> {
    fn from(rev: &'a RevisionRecord) -> Self {
        Self {
            revid: rev.revid,
            timestamp: rev.timestamp.timestamp(),
            user: rev.user.as_deref(),
            content: rev.content.as_deref(),
        }
    }
}

/// One JSON array per article, oldest revision first
pub struct JsonSink {
    naming: FileNaming,
}

impl JsonSink {
    pub fn new(dir: &Path, lang: &str) -> Self {
        Self {
            naming: FileNaming::new(dir, lang),
        }
    }

    pub fn with_suffix(mut self, suffix: &str) -> Self {
        self.naming.suffix = suffix.to_string();
        self
    }
}

impl OutcomeSink for JsonSink {
    fn write(&self, history: &CompletedHistory) -> io::Result<()> {
        let path = self.naming.path(history, OutputFormat::Json.extension());
        write_atomic(&path, |w| {
            let revisions: Vec<JsonRevision<'_>> =
                history.revisions.iter().map(JsonRevision::from).collect();
            serde_json::to_writer(&mut *w, &revisions)?;
            Ok(())
        })
    }
}

/// One MediaWiki export document per article
pub struct XmlSink {
    naming: FileNaming,
}

impl XmlSink {
    pub fn new(dir: &Path, lang: &str) -> Self {
        Self {
            naming: FileNaming::new(dir, lang),
        }
    }

    pub fn with_suffix(mut self, suffix: &str) -> Self {
        self.naming.suffix = suffix.to_string();
        self
    }

    fn write_document<W: Write>(&self, out: W, history: &CompletedHistory) -> io::Result<()> {
        let mut xml = Writer::new_with_indent(out, b' ', 2);
        xml.write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))?;
        xml.write_event(Event::Start(BytesStart::new("mediawiki").with_attributes([
            ("xmlns", EXPORT_NS),
            ("xmlns:xsi", "http://www.w3.org/2001/XMLSchema-instance"),
            ("xsi:schemaLocation", EXPORT_SCHEMA),
            ("version", "0.10"),
            ("xml:lang", self.naming.lang.as_str()),
        ])))?;
        xml.write_event(Event::Start(BytesStart::new("page")))?;

        let title = history.display_title();
        xml.create_element("title")
            .write_text_content(BytesText::new(&title))?;
        if let Some(page_id) = history.page_id {
            xml.create_element("id")
                .write_text_content(BytesText::new(&page_id.to_string()))?;
        }
        for rev in &history.revisions {
            write_revision(&mut xml, rev)?;
        }

        xml.write_event(Event::End(BytesEnd::new("page")))?;
        xml.write_event(Event::End(BytesEnd::new("mediawiki")))?;
        xml.get_mut().write_all(b"\n")
    }
}

fn write_revision<W: Write>(xml: &mut Writer<W>, rev: &RevisionRecord) -> io::Result<()> {
    xml.write_event(Event::Start(BytesStart::new("revision")))?;
    xml.create_element("id")
        .write_text_content(BytesText::new(&rev.revid.to_string()))?;
    if let Some(parent) = rev.parent_id {
        xml.create_element("parentid")
            .write_text_content(BytesText::new(&parent.to_string()))?;
    }
    let timestamp = rev.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true);
    xml.create_element("timestamp")
        .write_text_content(BytesText::new(&timestamp))?;

    match rev.user.as_deref() {
        Some(user) => {
            xml.write_event(Event::Start(BytesStart::new("contributor")))?;
            xml.create_element("username")
                .write_text_content(BytesText::new(user))?;
            if let Some(id) = rev.user_id {
                xml.create_element("id")
                    .write_text_content(BytesText::new(&id.to_string()))?;
            }
            xml.write_event(Event::End(BytesEnd::new("contributor")))?;
        }
        None => {
            xml.create_element("contributor")
                .with_attribute(("deleted", "deleted"))
                .write_empty()?;
        }
    }

    match rev.content.as_deref() {
        Some(text) => {
            let bytes = text.len().to_string();
            xml.create_element("text")
                .with_attribute(("bytes", bytes.as_str()))
                .with_attribute(("xml:space", "preserve"))
                .write_text_content(BytesText::new(text))?;
        }
        None => {
            xml.create_element("text")
                .with_attribute(("deleted", "deleted"))
                .write_empty()?;
        }
    }

    xml.write_event(Event::End(BytesEnd::new("revision")))
}

impl OutcomeSink for XmlSink {
    fn write(&self, history: &CompletedHistory) -> io::Result<()> {
        let path = self.naming.path(history, OutputFormat::Xml.extension());
        write_atomic(&path, |w| self.write_document(w, history))
    }
}
