mod common;

use common::{file, file_with_resource, fragmented_file, pattern, VolumeBuilder};
use hfsplus_explorer::{CatalogRecord, Completion, FileSystem, ForkType, HFSPError};
use std::io::{Cursor, Read, Seek, SeekFrom};

fn fragmented_volume() -> VolumeBuilder {
    VolumeBuilder::new(vec![
        // 20 single-block extents: 8 inline plus two overflow records
        fragmented_file(50, "scattered.bin", pattern(20 * 512 - 100, 11)),
        file_with_resource(51, "icon", b"data".to_vec(), pattern(1500, 5)),
        file(52, "after", b"tail".to_vec()),
    ])
}

fn mount(builder: &VolumeBuilder) -> FileSystem<Cursor<Vec<u8>>> {
    FileSystem::mount(Cursor::new(builder.build())).unwrap()
}

#[test]
fn test_extract_file_with_overflow_extents() {
    let volume = mount(&fragmented_volume());
    assert!(volume.extents_header().leaf_records >= 2);

    let record = volume.resolve_path(&["scattered.bin"], None).unwrap().into_inner();
    match &record.record {
        CatalogRecord::File(file) => {
            assert_eq!(file.data_fork.total_blocks, 20);
            assert_eq!(file.data_fork.used_extents().len(), 8);
        }
        other => panic!("expected a file, got {:?}", other),
    }

    let reader = volume.open_fork_reader(&record, ForkType::Data).unwrap();
    assert_eq!(reader.extents().len(), 20);

    let mut output = Vec::new();
    let written = volume
        .extract_fork(&record, ForkType::Data, &mut output, None)
        .unwrap();
    assert_eq!(written, Completion::Complete(20 * 512 - 100));
    assert_eq!(output, pattern(20 * 512 - 100, 11));
}

#[test]
fn test_random_access_across_extents() {
    let volume = mount(&fragmented_volume());
    let record = volume.resolve_path(&["scattered.bin"], None).unwrap().into_inner();
    let expected = pattern(20 * 512 - 100, 11);
    let mut reader = volume.open_fork_reader(&record, ForkType::Data).unwrap();

    // straddles the boundary between the inline and overflow extents
    let mut buffer = vec![0u8; 1024];
    reader.seek(SeekFrom::Start(8 * 512 - 300)).unwrap();
    reader.read_exact(&mut buffer).unwrap();
    assert_eq!(buffer, expected[8 * 512 - 300..8 * 512 + 724].to_vec());

    reader.seek(SeekFrom::Start(100)).unwrap();
    let mut head = [0u8; 50];
    reader.read_exact(&mut head).unwrap();
    assert_eq!(head.to_vec(), expected[100..150].to_vec());
}

#[test]
fn test_resource_fork() {
    let volume = mount(&fragmented_volume());
    let record = volume.resolve_path(&["icon"], None).unwrap().into_inner();

    let mut data = Vec::new();
    volume.extract_fork(&record, ForkType::Data, &mut data, None).unwrap();
    assert_eq!(data, b"data");

    let mut resource = Vec::new();
    let written = volume
        .extract_fork(&record, ForkType::Resource, &mut resource, None)
        .unwrap();
    assert_eq!(written.into_inner(), 1500);
    assert_eq!(resource, pattern(1500, 5));
}

#[test]
fn test_missing_overflow_record_is_inconsistent() {
    let mut builder = fragmented_volume();
    builder.omit_overflow = vec![(50, 16)];
    let volume = mount(&builder);
    let record = volume.resolve_path(&["scattered.bin"], None).unwrap().into_inner();
    assert!(matches!(
        volume.open_fork_reader(&record, ForkType::Data),
        Err(HFSPError::Inconsistent(_))
    ));

    // other files are unaffected
    let after = volume.resolve_path(&["after"], None).unwrap().into_inner();
    let mut output = Vec::new();
    volume.extract_fork(&after, ForkType::Data, &mut output, None).unwrap();
    assert_eq!(output, b"tail");
}
