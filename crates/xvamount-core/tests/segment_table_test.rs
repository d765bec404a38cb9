//! Integration tests for segment table construction.

use std::collections::BTreeMap;
use xvamount_core::index::ChunkLocation;
use xvamount_core::table::{
    build_table, render_table, total_sectors, Segment, SegmentKind, CHUNK_SECTORS, CHUNK_SIZE,
};

const ONE_MB: u64 = 1024 * 1024;

fn chunk_map(entries: &[(u64, u64, u64)]) -> BTreeMap<u64, ChunkLocation> {
    entries
        .iter()
        .map(|&(index, offset, size)| (index, ChunkLocation { offset, size }))
        .collect()
}

#[test]
fn test_reference_scenario() {
    // Present chunks at 0 and 3, absent at 1 and 2.
    let chunks = chunk_map(&[(0, 1024, ONE_MB), (3, 5_242_880, ONE_MB)]);
    let segments = build_table(&chunks, "dev").unwrap();

    assert_eq!(
        segments,
        vec![
            Segment {
                start_sector: 0,
                length_sectors: 2048,
                kind: SegmentKind::Linear {
                    device: "dev".to_string(),
                    offset_sectors: 2,
                },
            },
            Segment {
                start_sector: 2048,
                length_sectors: 4096,
                kind: SegmentKind::Zero,
            },
            Segment {
                start_sector: 6144,
                length_sectors: 2048,
                kind: SegmentKind::Linear {
                    device: "dev".to_string(),
                    offset_sectors: 10240,
                },
            },
        ]
    );
    assert_eq!(total_sectors(&segments), 8192);
}

#[test]
fn test_reference_scenario_text_protocol() {
    let chunks = chunk_map(&[(0, 1024, ONE_MB), (3, 5_242_880, ONE_MB)]);
    let segments = build_table(&chunks, "dev").unwrap();

    assert_eq!(
        render_table(&segments),
        "0 2048 linear dev 2\n2048 4096 zero\n6144 2048 linear dev 10240\n"
    );
}

#[test]
fn test_fully_present_disk_has_no_zero_segments() {
    let chunks = chunk_map(&[
        (0, 512, ONE_MB),
        (1, 512 + ONE_MB + 512, ONE_MB),
        (2, 512 + 2 * (ONE_MB + 512), ONE_MB),
    ]);
    let segments = build_table(&chunks, "/dev/loop0").unwrap();

    assert_eq!(segments.len(), 3);
    assert!(segments
        .iter()
        .all(|s| matches!(s.kind, SegmentKind::Linear { .. })));
    assert_eq!(total_sectors(&segments), 3 * CHUNK_SECTORS);
}

#[test]
fn test_adjacent_gaps_coalesce_into_one_zero_segment() {
    let chunks = chunk_map(&[(0, 512, ONE_MB), (7, 512 + ONE_MB + 512, ONE_MB)]);
    let segments = build_table(&chunks, "dev").unwrap();

    assert_eq!(segments.len(), 3, "six absent chunks collapse to one entry");
    assert_eq!(segments[1].kind, SegmentKind::Zero);
    assert_eq!(segments[1].length_sectors, 6 * CHUNK_SECTORS);
}

#[test]
fn test_no_adjacent_zero_segments_ever() {
    // Several gap patterns; zero segments must never touch.
    let patterns: Vec<Vec<u64>> = vec![
        vec![0, 2, 4, 9],
        vec![0, 1, 8],
        vec![0, 15],
        vec![0, 1, 2, 3],
    ];

    for present in patterns {
        let entries: Vec<(u64, u64, u64)> = present
            .iter()
            .enumerate()
            .map(|(i, &index)| (index, 512 + i as u64 * (ONE_MB + 512), ONE_MB))
            .collect();
        let chunks = chunk_map(&entries);
        let segments = build_table(&chunks, "dev").unwrap();

        for pair in segments.windows(2) {
            assert!(
                !(pair[0].kind == SegmentKind::Zero && pair[1].kind == SegmentKind::Zero),
                "adjacent zero segments in output for pattern {:?}",
                present
            );
        }
    }
}

#[test]
fn test_table_is_contiguous_and_sums_to_slot_count() {
    let patterns: Vec<Vec<u64>> = vec![vec![0, 3], vec![0, 1, 2], vec![0, 5, 6, 11]];

    for present in patterns {
        let entries: Vec<(u64, u64, u64)> = present
            .iter()
            .enumerate()
            .map(|(i, &index)| (index, 512 + i as u64 * (ONE_MB + 512), ONE_MB))
            .collect();
        let chunks = chunk_map(&entries);
        let segments = build_table(&chunks, "dev").unwrap();

        let slots = present.iter().max().unwrap() + 1;
        let mut cursor = 0;
        for segment in &segments {
            assert_eq!(segment.start_sector, cursor, "gap or overlap in table");
            cursor += segment.length_sectors;
        }
        assert_eq!(cursor, slots * CHUNK_SECTORS);
        assert_eq!(total_sectors(&segments), slots * CHUNK_SECTORS);
    }
}

#[test]
fn test_short_final_chunk_maps_its_exact_size() {
    // The last chunk of a disk may hold less than a full chunk unit.
    let chunks = chunk_map(&[(0, 512, ONE_MB), (1, 512 + ONE_MB + 512, 4096)]);
    let segments = build_table(&chunks, "dev").unwrap();

    assert_eq!(segments.len(), 2);
    assert_eq!(segments[1].length_sectors, 8);
}

#[test]
fn test_unaligned_chunk_size_is_format_error() {
    let chunks = chunk_map(&[(0, 512, CHUNK_SIZE - 1)]);
    assert!(build_table(&chunks, "dev").is_err());
}

#[test]
fn test_unaligned_archive_offset_is_format_error() {
    let chunks = chunk_map(&[(0, 513, ONE_MB)]);
    assert!(build_table(&chunks, "dev").is_err());
}
