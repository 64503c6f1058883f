//! End-to-end tests of the growable section volume.

use voxstack::volume::{SectionImage, Volume, VolumeError};

/// A deterministic test image: every voxel derived from its position and a seed.
fn test_section(seed: u8, height: u64, width: u64) -> SectionImage {
    let _ = env_logger::builder().is_test(true).try_init();
    let data = (0..height * width)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect();
    SectionImage::from_2d(height, width, data).unwrap()
}

#[tokio::test]
async fn two_sections_grow_the_array_forward() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut volume = Volume::create(dir.path(), "stack", [1, 2744, 2744])
        .await
        .unwrap();
    assert_eq!(volume.array_shape(), [0, 0, 0]);

    let section_a = test_section(3, 123, 342);
    volume.write_section(1, &section_a, [0, 0, 0]).await.unwrap();
    // the first write creates the array with the section's shape
    assert_eq!(volume.array_shape(), [1, 123, 342]);

    let section_b = test_section(7, 234, 423);
    volume
        .write_section(2, &section_b, [1, 100, 100])
        .await
        .unwrap();
    assert_eq!(volume.array_shape(), [2, 334, 523]);

    assert_eq!(volume.get_section_data(1).await.unwrap(), section_a);
    assert_eq!(volume.get_section_data(2).await.unwrap(), section_b);
    assert_eq!(volume.get_section_offset(2).unwrap(), [1, 100, 100]);
    assert_eq!(volume.sections(), &[Some(1), Some(2)]);
    assert_eq!(volume.origin(), &[0, 0, 0]);
}

#[tokio::test]
async fn negative_offsets_extend_backward_by_whole_chunks() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut volume = Volume::create(dir.path(), "stack", [1, 2744, 2744])
        .await
        .unwrap();
    let section_a = test_section(3, 123, 342);
    let section_b = test_section(7, 234, 423);
    volume.write_section(1, &section_a, [0, 0, 0]).await.unwrap();
    volume
        .write_section(2, &section_b, [1, 100, 100])
        .await
        .unwrap();

    let section_c = test_section(11, 234, 423);
    volume
        .write_section(3, &section_c, [2, -100, -2800])
        .await
        .unwrap();

    // one whole chunk prepended in Y, two in X
    assert_eq!(volume.origin(), &[0, 2744, 5488]);
    assert_eq!(volume.array_shape(), [3, 334 + 2744, 523 + 5488]);

    // recorded offsets shifted with the origin
    assert_eq!(volume.get_section_offset(1).unwrap(), [0, 2744, 5488]);
    assert_eq!(volume.get_section_offset(2).unwrap(), [1, 2844, 5588]);
    assert_eq!(volume.get_section_offset(3).unwrap(), [2, 2644, 2688]);

    // absolute origins are the offsets the sections were written at
    assert_eq!(volume.get_section_origin(1).unwrap(), [0, 0, 0]);
    assert_eq!(volume.get_section_origin(2).unwrap(), [1, 100, 100]);
    assert_eq!(volume.get_section_origin(3).unwrap(), [2, -100, -2800]);

    // previously written pixel content is unchanged
    assert_eq!(volume.get_section_data(1).await.unwrap(), section_a);
    assert_eq!(volume.get_section_data(2).await.unwrap(), section_b);
    assert_eq!(volume.get_section_data(3).await.unwrap(), section_c);
}

#[tokio::test]
async fn origin_only_grows() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut volume = Volume::create(dir.path(), "stack", [1, 8, 8]).await.unwrap();
    volume
        .write_section(1, &test_section(1, 4, 4), [0, 0, 0])
        .await
        .unwrap();
    let mut previous = *volume.origin();
    for (section_id, offset) in [
        (2, [1, -3, 2]),
        (3, [2, 5, -20]),
        (4, [3, -1, -1]),
        (5, [4, 0, 0]),
    ] {
        volume
            .write_section(section_id, &test_section(section_id as u8, 4, 4), offset)
            .await
            .unwrap();
        let origin = *volume.origin();
        assert!((0..3).all(|axis| origin[axis] >= previous[axis]));
        assert!((0..3).all(|axis| origin[axis] % volume.chunk_shape()[axis] == 0));
        previous = origin;
    }
    // every section still reads back exactly
    for section_id in 1..=5u64 {
        assert_eq!(
            volume.get_section_data(section_id).await.unwrap(),
            test_section(section_id as u8, 4, 4)
        );
    }
}

#[tokio::test]
async fn duplicate_sections_are_rejected() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut volume = Volume::create(dir.path(), "stack", [1, 8, 8]).await.unwrap();
    volume
        .write_section(7, &test_section(0, 4, 4), [0, 0, 0])
        .await
        .unwrap();
    assert!(matches!(
        volume
            .write_section(7, &test_section(1, 4, 4), [1, 0, 0])
            .await,
        Err(VolumeError::DuplicateSection(7))
    ));
}

#[tokio::test]
async fn append_resolves_against_the_last_section() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut volume = Volume::create(dir.path(), "stack", [1, 8, 8]).await.unwrap();

    // an empty volume appends at the origin
    volume
        .append_section(1, &test_section(1, 4, 4), [1, 0, 0])
        .await
        .unwrap();
    assert_eq!(volume.get_section_offset(1).unwrap(), [0, 0, 0]);

    volume
        .append_section(2, &test_section(2, 4, 4), [1, 2, 3])
        .await
        .unwrap();
    assert_eq!(volume.get_section_offset(2).unwrap(), [1, 2, 3]);

    // one slice deeper, no XY shift
    volume
        .append_section(3, &test_section(3, 4, 4), [1, 0, 0])
        .await
        .unwrap();
    assert_eq!(volume.get_section_offset(3).unwrap(), [2, 2, 3]);

    // appends skip removed slots when resolving the previous section
    volume.remove_section(3).await.unwrap();
    volume
        .append_section(4, &test_section(4, 4, 4), [1, 0, 0])
        .await
        .unwrap();
    assert_eq!(volume.get_section_offset(4).unwrap(), [2, 2, 3]);
}

#[tokio::test]
async fn removal_restores_the_previous_state() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut volume = Volume::create(dir.path(), "stack", [1, 8, 8]).await.unwrap();
    let section_a = test_section(1, 6, 6);
    let section_b = test_section(2, 5, 7);
    volume.write_section(1, &section_a, [0, 0, 0]).await.unwrap();

    let shape_before = volume.array_shape();
    let offsets_before = volume.get_section_offset(1).unwrap();

    volume.write_section(2, &section_b, [1, 1, 1]).await.unwrap();
    assert_eq!(volume.array_shape(), [2, 6, 8]);
    volume.remove_section(2).await.unwrap();

    // the Z extent shrinks back by exactly one chunk row
    assert_eq!(volume.array_shape()[0], shape_before[0]);
    assert_eq!(volume.get_section_offset(1).unwrap(), offsets_before);
    assert!(matches!(
        volume.get_section_data(2).await,
        Err(VolumeError::SectionNotFound(2))
    ));
    // the freed slot stays as a placeholder
    assert_eq!(volume.sections(), &[Some(1), None]);
    assert_eq!(volume.get_section_data(1).await.unwrap(), section_a);
}

#[tokio::test]
async fn removal_shifts_higher_sections_down() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut volume = Volume::create(dir.path(), "stack", [1, 8, 8]).await.unwrap();
    for section_id in 0..4u64 {
        volume
            .append_section(section_id, &test_section(section_id as u8, 4, 4), [1, 0, 0])
            .await
            .unwrap();
    }
    volume.remove_section(1).await.unwrap();

    assert_eq!(volume.array_shape()[0], 3);
    assert_eq!(volume.get_section_offset(0).unwrap()[0], 0);
    assert_eq!(volume.get_section_offset(2).unwrap()[0], 1);
    assert_eq!(volume.get_section_offset(3).unwrap()[0], 2);
    for section_id in [0u64, 2, 3] {
        assert_eq!(
            volume.get_section_data(section_id).await.unwrap(),
            test_section(section_id as u8, 4, 4)
        );
    }
}

#[tokio::test]
async fn inserting_into_the_stack_shifts_higher_slices_up() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut volume = Volume::create(dir.path(), "stack", [1, 8, 8]).await.unwrap();
    volume
        .write_section(1, &test_section(1, 4, 4), [0, 0, 0])
        .await
        .unwrap();
    volume
        .write_section(2, &test_section(2, 4, 4), [1, 0, 0])
        .await
        .unwrap();

    // Z offset inside the existing stack inserts a slice
    volume
        .write_section(3, &test_section(3, 4, 4), [1, 1, 1])
        .await
        .unwrap();
    assert_eq!(volume.array_shape()[0], 3);
    assert_eq!(volume.sections(), &[Some(1), Some(3), Some(2)]);
    assert_eq!(volume.get_section_offset(1).unwrap()[0], 0);
    assert_eq!(volume.get_section_offset(3).unwrap()[0], 1);
    assert_eq!(volume.get_section_offset(2).unwrap()[0], 2);
    for section_id in 1..=3u64 {
        assert_eq!(
            volume.get_section_data(section_id).await.unwrap(),
            test_section(section_id as u8, 4, 4)
        );
    }
}

#[tokio::test]
async fn volumes_reload_to_the_same_state() {
    let dir = tempfile::TempDir::new().unwrap();
    let volume_dir = {
        let mut volume = Volume::create(dir.path(), "stack", [1, 8, 8]).await.unwrap();
        volume
            .write_section(1, &test_section(1, 6, 6), [0, 0, 0])
            .await
            .unwrap();
        volume
            .write_section(2, &test_section(2, 6, 6), [1, -3, 2])
            .await
            .unwrap();
        volume
            .write_section(3, &test_section(3, 6, 6), [2, 0, 0])
            .await
            .unwrap();
        volume.remove_section(3).await.unwrap();
        volume.volume_dir()
    };

    let volume = Volume::load(&volume_dir).await.unwrap();
    assert_eq!(volume.name(), "stack");
    assert_eq!(volume.origin(), &[0, 8, 0]);
    assert_eq!(volume.sections(), &[Some(1), Some(2), None]);
    assert_eq!(volume.get_section_offset(1).unwrap(), [0, 8, 0]);
    assert_eq!(volume.get_section_offset(2).unwrap(), [1, 5, 2]);
    assert_eq!(volume.get_section_data(1).await.unwrap(), test_section(1, 6, 6));
    assert_eq!(volume.get_section_data(2).await.unwrap(), test_section(2, 6, 6));

    // creating over an existing volume is rejected
    assert!(matches!(
        Volume::create(dir.path(), "stack", [1, 8, 8]).await,
        Err(VolumeError::AlreadyExists(_))
    ));
}

#[tokio::test]
async fn loading_detects_sections_beyond_the_stored_array() {
    let dir = tempfile::TempDir::new().unwrap();
    let volume_dir = {
        let mut volume = Volume::create(dir.path(), "stack", [1, 8, 8]).await.unwrap();
        volume
            .write_section(1, &test_section(1, 6, 6), [0, 0, 0])
            .await
            .unwrap();
        volume.volume_dir()
    };

    // simulate an interrupted resize: the sidecar claims a section the
    // stored array shape cannot hold
    let record_path = volume_dir.join("volume.json");
    let mut record: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&record_path).unwrap()).unwrap();
    record["offsets"]["1"] = serde_json::json!([4, 0, 0]);
    std::fs::write(&record_path, serde_json::to_vec_pretty(&record).unwrap()).unwrap();

    assert!(matches!(
        Volume::load(&volume_dir).await,
        Err(VolumeError::InconsistentMetadata(_, _))
    ));
}
