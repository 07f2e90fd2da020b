use std::os::unix::fs::PermissionsExt as _;

use appbits_core::blobstore::cache_key;
use appbits_test_support::{TestContext, sha1_hex};
use object_store::ObjectStore as _;

#[test]
fn test_cache_key_is_partitioned() {
    let key = cache_key("8b381f8864b572841a26266791c64ae97738a659");
    assert_eq!(
        key.as_ref(),
        "8b/38/8b381f8864b572841a26266791c64ae97738a659"
    );
}

#[tokio::test]
async fn test_fetch_by_hash_missing() -> anyhow::Result<()> {
    let context = TestContext::new().await;
    let cache = context.app_bits_cache();
    let destination = context.path("out/file");

    let found = cache
        .fetch_by_hash(&sha1_hex("nothing"), &destination, 0o644)
        .await?;

    assert!(!found);
    assert!(!destination.exists());

    Ok(())
}

#[tokio::test]
async fn test_fetch_by_hash_sets_mode() -> anyhow::Result<()> {
    let context = TestContext::new().await;
    let cache = context.app_bits_cache();
    let sha1 = context.cache_blob("cached content").await;
    let destination = context.path("out/nested/file");

    let found = cache.fetch_by_hash(&sha1, &destination, 0o600).await?;

    assert!(found);
    assert_eq!(tokio::fs::read_to_string(&destination).await?, "cached content");
    let mode = tokio::fs::metadata(&destination).await?.permissions().mode();
    assert_eq!(mode & 0o777, 0o600);

    Ok(())
}

#[tokio::test]
async fn test_cp_r_to_blobstore() -> anyhow::Result<()> {
    let context = TestContext::new().await;
    let cache = context.app_bits_cache();
    context.write_file("app/a.txt", "a").await;
    context.write_file("app/nested/b.txt", "b").await;
    context.write_file("app/nested/same-as-a.txt", "a").await;
    context.write_symlink("a.txt", "app/link").await;

    let added = cache.cp_r_to_blobstore(&context.path("app")).await?;

    assert_eq!(added, 2);
    assert!(cache.exists(&sha1_hex("a")).await?);
    assert!(cache.exists(&sha1_hex("b")).await?);
    // The symlink's target path isn't stored as content
    assert!(!cache.exists(&sha1_hex("a.txt")).await?);

    // Seeding again leaves existing blobs alone
    let added_again = cache.cp_r_to_blobstore(&context.path("app")).await?;
    assert_eq!(added_again, 0);

    Ok(())
}

#[tokio::test]
async fn test_cp_r_to_blobstore_skips_large_files() -> anyhow::Result<()> {
    let context = TestContext::new().await;
    let cache = context
        .app_bits_cache()
        .with_max_resource_size(Some(4));
    context.write_file("app/small", "1234").await;
    context.write_file("app/large", "12345").await;

    let added = cache.cp_r_to_blobstore(&context.path("app")).await?;

    assert_eq!(added, 1);
    assert!(cache.exists(&sha1_hex("1234")).await?);
    assert!(!cache.exists(&sha1_hex("12345")).await?);

    Ok(())
}

#[tokio::test]
async fn test_cp_to_blobstore() -> anyhow::Result<()> {
    let context = TestContext::new().await;
    let blobstore = context.package_blobstore();
    let contents = vec![7_u8; 3 * 1024 * 1024];
    let local = context.write_file("package.zip", &contents).await;

    assert!(!blobstore.exists("packages/guid").await?);
    blobstore.cp_to_blobstore(&local, "packages/guid").await?;
    assert!(blobstore.exists("packages/guid").await?);

    let stored = context
        .package_store
        .get(&object_store::path::Path::from("packages/guid"))
        .await?
        .bytes()
        .await?;
    assert_eq!(stored.as_ref(), contents.as_slice());

    Ok(())
}
