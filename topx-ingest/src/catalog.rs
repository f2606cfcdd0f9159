//! [`RemoteCatalog`] over the Preservica entity API.
//!
//! Requests are XIP documents, responses are parsed by element local name so the
//! namespace version the server answers with does not matter.

use std::sync::Arc;

use async_trait::async_trait;
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use topx_ingest_core::contract::{
    ContainerRef, NewContainer, PermanentError, RemoteCatalog, RemoteEntity,
};
use topx_ingest_core::BoxError;
use tracing::{debug, info, warn};

use crate::session::PreservicaSession;

const STRUCTURAL_OBJECTS: &str = "/api/entity/structural-objects";
const STRUCTURAL_OBJECT_TYPE: &str = "SO";

pub struct PreservicaCatalog {
    session: Arc<PreservicaSession>,
}

impl PreservicaCatalog {
    pub fn new(session: Arc<PreservicaSession>) -> Self {
        Self { session }
    }

    fn namespace(&self) -> &str {
        &self.session.settings().xip_namespace
    }
}

#[async_trait]
impl RemoteCatalog for PreservicaCatalog {
    async fn find_by_identifier(
        &self,
        scheme: &str,
        value: &str,
    ) -> Result<Vec<RemoteEntity>, BoxError> {
        let body = self
            .session
            .get(
                "/api/entity/entities/by-identifier",
                &[("type", scheme), ("value", value)],
            )
            .await?;
        let entities = parse_entities(&body)?;
        debug!(scheme, value, found = entities.len(), "Identifier lookup");
        Ok(entities)
    }

    async fn fetch_container(&self, reference: &ContainerRef) -> Result<RemoteEntity, BoxError> {
        let body = self
            .session
            .get(&format!("{STRUCTURAL_OBJECTS}/{reference}"), &[])
            .await?;
        parse_structural_object(&body)
    }

    async fn create_container(&self, request: NewContainer) -> Result<RemoteEntity, BoxError> {
        let document = structural_object_xml(self.namespace(), &request);
        let body = self
            .session
            .post_xml(STRUCTURAL_OBJECTS, document)
            .await?;
        let created = created_entity(&body, &request);
        info!(reference = %created.reference, title = %created.title, "Created structural object");
        Ok(created)
    }

    async fn attach_identifier(
        &self,
        entity: &RemoteEntity,
        scheme: &str,
        value: &str,
    ) -> Result<(), BoxError> {
        let document = identifier_xml(self.namespace(), &entity.reference, scheme, value);
        self.session
            .post_xml(
                &format!("{STRUCTURAL_OBJECTS}/{}/identifiers", entity.reference),
                document,
            )
            .await?;
        Ok(())
    }

    async fn attach_metadata(
        &self,
        entity: &RemoteEntity,
        schema_uri: &str,
        document: Vec<u8>,
    ) -> Result<RemoteEntity, BoxError> {
        let content = strip_xml_declaration(&document)?;
        let body = metadata_container_xml(self.namespace(), &entity.reference, schema_uri, content);
        self.session
            .post_xml(
                &format!("{STRUCTURAL_OBJECTS}/{}/metadata", entity.reference),
                body,
            )
            .await?;
        Ok(entity.clone())
    }

    fn reference(&self, entity: &RemoteEntity) -> ContainerRef {
        entity.reference.clone()
    }
}

/// The entity a create call returned, or the requested one when the response
/// body cannot be read.
pub fn created_entity(body: &str, request: &NewContainer) -> RemoteEntity {
    parse_structural_object(body).unwrap_or_else(|e| {
        warn!(
            reference = %request.reference,
            error = %e,
            "Unreadable create response, using the requested reference"
        );
        RemoteEntity {
            reference: request.reference.clone(),
            title: request.title.clone(),
            entity_type: STRUCTURAL_OBJECT_TYPE.to_string(),
        }
    })
}

pub fn structural_object_xml(namespace: &str, request: &NewContainer) -> String {
    let parent = request
        .parent
        .as_ref()
        .map(|p| format!("<Parent>{}</Parent>", escape(p.as_str())))
        .unwrap_or_default();
    format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><StructuralObject xmlns="{ns}"><Ref>{reference}</Ref><Title>{title}</Title><Description>{description}</Description><SecurityTag>{tag}</SecurityTag>{parent}</StructuralObject>"#,
        ns = escape(namespace),
        reference = escape(request.reference.as_str()),
        title = escape(request.title.as_str()),
        description = escape(request.description.as_str()),
        tag = escape(request.security_tag.as_str()),
    )
}

pub fn identifier_xml(namespace: &str, entity: &ContainerRef, scheme: &str, value: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><Identifier xmlns="{ns}"><Type>{scheme}</Type><Value>{value}</Value><Entity>{entity}</Entity></Identifier>"#,
        ns = escape(namespace),
        scheme = escape(scheme),
        value = escape(value),
        entity = escape(entity.as_str()),
    )
}

/// Wraps `content`, an XML fragment without declaration, in a `MetadataContainer`.
pub fn metadata_container_xml(
    namespace: &str,
    entity: &ContainerRef,
    schema_uri: &str,
    content: &str,
) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><MetadataContainer xmlns="{ns}" schemaUri="{schema}"><Entity>{entity}</Entity><Content>{content}</Content></MetadataContainer>"#,
        ns = escape(namespace),
        schema = escape(schema_uri),
        entity = escape(entity.as_str()),
    )
}

/// The document as text with a leading BOM and `<?xml ...?>` declaration removed.
pub fn strip_xml_declaration(document: &[u8]) -> Result<&str, BoxError> {
    let text = std::str::from_utf8(document)?;
    let text = text.trim_start_matches('\u{feff}').trim_start();
    if !text.starts_with("<?xml") {
        return Ok(text);
    }
    match text.find("?>") {
        Some(end) => Ok(text[end + 2..].trim_start()),
        None => Err(PermanentError::boxed("unterminated XML declaration")),
    }
}

fn entity_from_attributes(element: &BytesStart) -> Result<Option<RemoteEntity>, BoxError> {
    let mut reference = None;
    let mut title = String::new();
    let mut entity_type = String::new();
    for attribute in element.attributes() {
        let attribute = attribute?;
        let value = attribute.unescape_value()?.into_owned();
        match attribute.key.local_name().as_ref() {
            b"ref" => reference = Some(value),
            b"title" => title = value,
            b"type" => entity_type = value,
            _ => {}
        }
    }
    Ok(reference.map(|r| RemoteEntity {
        reference: ContainerRef::new(r),
        title,
        entity_type,
    }))
}

/// Parses the `Entity` elements of an identifier lookup response.
pub fn parse_entities(xml: &str) -> Result<Vec<RemoteEntity>, BoxError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut entities = Vec::new();
    loop {
        match reader.read_event()? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"Entity" => {
                if let Some(entity) = entity_from_attributes(&e)? {
                    entities.push(entity);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(entities)
}

/// Parses an entity response holding one `StructuralObject`.
pub fn parse_structural_object(xml: &str) -> Result<RemoteEntity, BoxError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut in_object = false;
    let mut current: Option<&'static str> = None;
    let mut reference: Option<String> = None;
    let mut title: Option<String> = None;
    loop {
        match reader.read_event()? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"StructuralObject" => in_object = true,
                b"Ref" if in_object && reference.is_none() => current = Some("Ref"),
                b"Title" if in_object && title.is_none() => current = Some("Title"),
                _ => current = None,
            },
            Event::Text(text) => match current.take() {
                Some("Ref") => reference = Some(text.unescape()?.trim().to_string()),
                Some("Title") => title = Some(text.unescape()?.trim().to_string()),
                _ => {}
            },
            Event::End(e) => {
                current = None;
                if e.local_name().as_ref() == b"StructuralObject" {
                    break;
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    match reference {
        Some(reference) if !reference.is_empty() => Ok(RemoteEntity {
            reference: ContainerRef::new(reference),
            title: title.unwrap_or_default(),
            entity_type: STRUCTURAL_OBJECT_TYPE.to_string(),
        }),
        _ => Err("response holds no StructuralObject reference".into()),
    }
}
