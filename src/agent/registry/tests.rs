use super::*;
use tempfile::TempDir;

#[test]
fn ids_round_trip_through_strings_and_serde() {
    for id in DocumentId::ALL {
        assert_eq!(
            id.as_str().parse::<DocumentId>().expect("known id parses"),
            *id
        );
        assert_eq!(
            serde_json::to_value(id).expect("id serializes"),
            serde_json::Value::String(id.to_string())
        );
    }
}

#[test]
fn unknown_ids_are_validation_errors() {
    for bad in ["", "Breviary_Of_Targossas", "../etc/passwd", "apocrypha"] {
        assert!(matches!(
            bad.parse::<DocumentId>(),
            Err(BreviaryError::Validation(_))
        ));
    }
}

#[test]
fn catalog_lists_every_document() {
    let registry = DocumentRegistry::new("docs");
    let catalog = registry.catalog();

    assert_eq!(catalog.lines().count(), DocumentId::ALL.len());
    assert!(catalog.starts_with("- breviary_of_targossas: The Breviary of Targossas"));
}

#[test]
fn tool_schema_enumerates_ids() {
    let tool = DocumentRegistry::new("docs").tool_definition();

    assert_eq!(tool.kind, "function");
    assert_eq!(tool.function.name, FETCH_DOCUMENT_TOOL);
    assert_eq!(
        tool.function.parameters["properties"]["document_id"]["enum"],
        json!(["breviary_of_targossas"])
    );
    assert_eq!(tool.function.parameters["required"], json!(["document_id"]));
}

#[tokio::test]
async fn reads_documents_from_docs_dir() {
    let dir = TempDir::new().expect("should create temp dir");
    std::fs::write(
        dir.path().join("breviary_of_targossas.txt"),
        "1. We pray for the Light.\n<So mote it be.>",
    )
    .expect("should write breviary");

    let registry = DocumentRegistry::new(dir.path());
    let text = registry
        .read(DocumentId::BreviaryOfTargossas)
        .await
        .expect("should read document");
    assert!(text.contains("So mote it be"));
}

#[tokio::test]
async fn missing_document_is_an_io_error() {
    let dir = TempDir::new().expect("should create temp dir");
    let registry = DocumentRegistry::new(dir.path());

    let err = registry
        .read(DocumentId::BreviaryOfTargossas)
        .await
        .expect_err("file is absent");
    assert!(matches!(err, BreviaryError::Io(_)));
    assert!(err.to_string().contains("breviary_of_targossas.txt"));
}
