//! Property-based tests for container round-trips
//!
//! Uses proptest to check that streams survive write/close/reopen unchanged
//! across random lengths, block sizes, interleavings and removals.

use muxfile::{DefaultReader, DefaultWriter, ReaderOptions, WriterOptions, HEADER_SIZE};
use proptest::prelude::*;

fn options(block_size: u32) -> WriterOptions {
    WriterOptions {
        block_size,
        ..Default::default()
    }
}

fn read_all(reader: &DefaultReader, id: i32) -> Vec<u8> {
    let mut stream = reader.open_stream(id).unwrap();
    let mut out = vec![0u8; stream.length() as usize];
    let n = stream.read(&mut out).unwrap();
    assert_eq!(n, out.len());
    out
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_round_trip(
        block_size in prop::sample::select(vec![8u32, 12, 16, 64, 100]),
        data in prop::collection::vec(any::<u8>(), 0..3000),
    ) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("round_trip.mux");
        {
            let writer = DefaultWriter::create(&path, options(block_size)).unwrap();
            let stream = writer.new_stream().unwrap();
            stream.write(&data).unwrap();
            stream.close().unwrap();
            writer.close().unwrap();
        }

        let reader = DefaultReader::open(&path, ReaderOptions::default()).unwrap();
        prop_assert_eq!(read_all(&reader, 0), data);
        prop_assert!(reader.verify().unwrap().is_empty());
    }

    #[test]
    fn prop_seek_then_read_matches_suffix(
        len in 1usize..2500,
        offsets in prop::collection::vec(any::<prop::sample::Index>(), 1..12),
    ) {
        let data: Vec<u8> = (0..len).map(|i| (i * 7 % 251) as u8).collect();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seek.mux");
        {
            let writer = DefaultWriter::create(&path, options(16)).unwrap();
            let stream = writer.new_stream().unwrap();
            stream.write(&data).unwrap();
            stream.close().unwrap();
            writer.close().unwrap();
        }

        let reader = DefaultReader::open(&path, ReaderOptions::default()).unwrap();
        let mut stream = reader.open_stream(0).unwrap();
        for offset in offsets {
            let pos = offset.index(len);
            stream.seek(pos as u64).unwrap();
            let mut rest = vec![0u8; len - pos];
            prop_assert_eq!(stream.read(&mut rest).unwrap(), len - pos);
            prop_assert_eq!(&rest[..], &data[pos..]);
        }
    }

    #[test]
    fn prop_interleaving_is_invisible(
        chunks in prop::collection::vec((0usize..3, 0usize..90), 1..80),
    ) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("interleave.mux");
        let mut expected = vec![Vec::new(); 3];
        {
            let writer = DefaultWriter::create(&path, options(16)).unwrap();
            let streams: Vec<_> = (0..3).map(|_| writer.new_stream().unwrap()).collect();
            for (i, &(target, size)) in chunks.iter().enumerate() {
                let chunk: Vec<u8> = (0..size).map(|j| (i + j) as u8).collect();
                streams[target].write(&chunk).unwrap();
                expected[target].extend_from_slice(&chunk);
            }
            for stream in &streams {
                stream.close().unwrap();
            }
            drop(streams);
            writer.close().unwrap();
        }

        let reader = DefaultReader::open(&path, ReaderOptions::default()).unwrap();
        for (id, want) in expected.iter().enumerate() {
            prop_assert_eq!(&read_all(&reader, id as i32), want);
        }
    }

    #[test]
    fn prop_compaction_leaves_no_gaps(
        plan in prop::collection::vec((0usize..700, any::<bool>()), 1..16),
    ) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("compact.mux");
        {
            let writer = DefaultWriter::create(&path, options(16)).unwrap();
            let streams: Vec<_> = plan
                .iter()
                .enumerate()
                .map(|(i, &(len, _))| {
                    let stream = writer.new_stream().unwrap();
                    stream.write(&vec![i as u8; len]).unwrap();
                    stream
                })
                .collect();
            for (stream, &(_, keep)) in streams.iter().zip(&plan) {
                if keep {
                    stream.close().unwrap();
                } else {
                    stream.remove().unwrap();
                }
            }
            drop(streams);
            writer.close().unwrap();
        }

        let reader = DefaultReader::open(&path, ReaderOptions::default()).unwrap();
        let file_len = std::fs::metadata(&path).unwrap().len();
        prop_assert_eq!(
            file_len,
            HEADER_SIZE as u64 + reader.block_count() as u64 * 16
        );
        prop_assert!(reader.verify().unwrap().is_empty());
        for (i, &(len, keep)) in plan.iter().enumerate() {
            prop_assert_eq!(reader.has_stream(i as i32), keep);
            if keep {
                prop_assert_eq!(read_all(&reader, i as i32), vec![i as u8; len]);
            }
        }
    }
}
