use std::path::PathBuf;

use callquote_core::business::{piano_moving_profile, SchemaSource};
use callquote_db::businesses::load_business_directory;

fn shipped_directory() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../businesses")
}

#[tokio::test]
async fn shipped_piano_profile_matches_the_builtin_one() -> Result<(), String> {
    let source = load_business_directory(&shipped_directory()).map_err(|e| e.to_string())?;

    let business_id = source.resolve_business("+1 229 922 3706").await.map_err(|e| e.to_string())?;
    assert_eq!(business_id, "piano_moving_001");

    let loaded = source.load_profile(&business_id).await.map_err(|e| e.to_string())?;
    let builtin = piano_moving_profile().map_err(|e| e.to_string())?;
    assert_eq!(*loaded, builtin);
    Ok(())
}
