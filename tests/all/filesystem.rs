use anyhow::Result;
use bytes::Bytes;
use preview2_shim::filesystem::{
    Descriptor, DescriptorFlags, DescriptorType, ErrorCode, OpenFlags, PathFlags,
};
use preview2_shim::stream::stream_pair;
use preview2_shim::{DirPerms, FilePerms, ShimCtx};

fn sandbox(dir_perms: DirPerms, file_perms: FilePerms) -> Result<(tempfile::TempDir, Descriptor)> {
    let dir = tempfile::tempdir()?;
    let mut builder = ShimCtx::builder();
    builder.preopened_dir(dir.path(), "/", dir_perms, file_perms)?;
    let (root, _) = builder
        .build()
        .preopens()
        .pop()
        .ok_or_else(|| anyhow::anyhow!("no preopen"))?;
    Ok((dir, root))
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn write_then_read_back() -> Result<()> {
    let (_dir, root) = sandbox(DirPerms::all(), FilePerms::all())?;
    let file = root
        .open_at(
            PathFlags::empty(),
            "notes.txt",
            OpenFlags::CREATE,
            DescriptorFlags::READ | DescriptorFlags::WRITE,
        )
        .await?;

    let (mut tx, rx) = stream_pair();
    let mut written = file.write_via_stream(rx, 0)?;
    tx.write(Bytes::from_static(b"hello, ")).await?;
    tx.write(Bytes::from_static(b"world")).await?;
    drop(tx);
    assert_eq!(written.read().await?, Some(()));
    assert_eq!(file.stat().await?.size, 12);

    let (mut contents, mut done) = file.read_via_stream(7)?;
    assert_eq!(contents.read_all().await?, Bytes::from_static(b"world"));
    assert_eq!(done.read().await?, Some(()));
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn appends_land_at_the_end() -> Result<()> {
    let (_dir, root) = sandbox(DirPerms::all(), FilePerms::all())?;
    let flags = DescriptorFlags::READ | DescriptorFlags::WRITE;
    let file = root
        .open_at(PathFlags::empty(), "log", OpenFlags::CREATE, flags)
        .await?;
    for line in ["a\n", "b\n"] {
        let (mut tx, rx) = stream_pair();
        let mut done = file.append_via_stream(rx)?;
        tx.write(Bytes::from(line)).await?;
        drop(tx);
        done.read().await?;
    }
    let (mut contents, _) = file.read_via_stream(0)?;
    assert_eq!(contents.read_all().await?, Bytes::from_static(b"a\nb\n"));
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn paths_cannot_escape_the_preopen() -> Result<()> {
    let (_dir, root) = sandbox(DirPerms::all(), FilePerms::all())?;
    for path in ["../x", "/etc/passwd", "a/../../x"] {
        let err = root
            .open_at(
                PathFlags::empty(),
                path,
                OpenFlags::empty(),
                DescriptorFlags::READ,
            )
            .await
            .unwrap_err();
        assert_eq!(*err.code(), ErrorCode::NotPermitted, "{path}");
    }
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn directories_list_their_entries() -> Result<()> {
    let (dir, root) = sandbox(DirPerms::all(), FilePerms::all())?;
    std::fs::write(dir.path().join("file"), b"x")?;
    root.create_directory_at("sub").await?;

    let (mut entries, mut done) = root.read_directory()?;
    let mut seen = Vec::new();
    while let Some(entry) = entries.read().await? {
        seen.push((entry.name, entry.type_));
    }
    done.read().await?;
    seen.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(
        seen,
        [
            ("file".to_string(), DescriptorType::RegularFile),
            ("sub".to_string(), DescriptorType::Directory),
        ]
    );
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn read_only_preopens_refuse_writes() -> Result<()> {
    let (dir, root) = sandbox(DirPerms::READ, FilePerms::READ)?;
    std::fs::write(dir.path().join("existing"), b"x")?;
    let err = root
        .open_at(
            PathFlags::empty(),
            "new",
            OpenFlags::CREATE,
            DescriptorFlags::WRITE,
        )
        .await
        .unwrap_err();
    assert_eq!(*err.code(), ErrorCode::NotPermitted);

    let file = root
        .open_at(
            PathFlags::empty(),
            "existing",
            OpenFlags::empty(),
            DescriptorFlags::READ,
        )
        .await?;
    let (_tx, rx) = stream_pair();
    let err = file.write_via_stream(rx, 0).unwrap_err();
    assert_eq!(*err.code(), ErrorCode::NotPermitted);
    Ok(())
}
