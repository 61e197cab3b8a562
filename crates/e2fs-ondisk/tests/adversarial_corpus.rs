#![forbid(unsafe_code)]

use e2fs_ondisk::{
    Ext2GroupDesc, Ext2Inode, Ext2Superblock, iter_dir_block, parse_dir_block,
    parse_group_desc_table,
};
use e2fs_types::{EXT2_SUPER_MAGIC, EXT2_SUPERBLOCK_SIZE, ParseError};
use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};

#[derive(Debug, Default)]
struct ErrorCoverage {
    insufficient_data: u32,
    invalid_magic: u32,
    invalid_field: u32,
    integer_conversion: u32,
}

impl ErrorCoverage {
    fn observe(&mut self, err: &ParseError) {
        match err {
            ParseError::InsufficientData { .. } => self.insufficient_data += 1,
            ParseError::InvalidMagic { .. } => self.invalid_magic += 1,
            ParseError::InvalidField { .. } => self.invalid_field += 1,
            ParseError::IntegerConversion { .. } => self.integer_conversion += 1,
        }
    }
}

/// xorshift32; deterministic so failures reproduce.
struct Rng(u32);

impl Rng {
    fn next_u32(&mut self) -> u32 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.0 = x;
        x
    }

    fn below(&mut self, bound: usize) -> usize {
        self.next_u32() as usize % bound.max(1)
    }
}

fn valid_superblock_region() -> Vec<u8> {
    let mut region = vec![0_u8; EXT2_SUPERBLOCK_SIZE];
    region[0x00..0x04].copy_from_slice(&32_u32.to_le_bytes());
    region[0x04..0x08].copy_from_slice(&256_u32.to_le_bytes());
    region[0x14..0x18].copy_from_slice(&1_u32.to_le_bytes());
    region[0x20..0x24].copy_from_slice(&8192_u32.to_le_bytes());
    region[0x28..0x2C].copy_from_slice(&32_u32.to_le_bytes());
    region[0x38..0x3A].copy_from_slice(&EXT2_SUPER_MAGIC.to_le_bytes());
    region
}

fn valid_dir_block() -> Vec<u8> {
    let mut block = vec![0_u8; 1024];
    block[0..4].copy_from_slice(&2_u32.to_le_bytes());
    block[4..6].copy_from_slice(&12_u16.to_le_bytes());
    block[6] = 1;
    block[7] = 2;
    block[8] = b'.';
    block[12..16].copy_from_slice(&2_u32.to_le_bytes());
    block[16..18].copy_from_slice(&1012_u16.to_le_bytes());
    block[18] = 2;
    block[19] = 2;
    block[20..22].copy_from_slice(b"..");
    block
}

/// Truncations plus byte flips of each seed sample.
fn build_corpus(rng: &mut Rng) -> Vec<(String, Vec<u8>)> {
    let seeds = [
        ("superblock", valid_superblock_region()),
        ("dir_block", valid_dir_block()),
        ("zeroes", vec![0_u8; 1024]),
        ("ones", vec![0xFF_u8; 1024]),
    ];
    let mut out = Vec::new();
    for (name, seed) in &seeds {
        for cut in [0, 1, 7, 8, 31, 32, 127, 128, 512] {
            out.push((format!("{name}-trunc{cut}"), seed[..cut.min(seed.len())].to_vec()));
        }
        for round in 0..16 {
            let mut sample = seed.clone();
            for _ in 0..=rng.below(8) {
                let idx = rng.below(sample.len());
                sample[idx] = rng.next_u32().to_le_bytes()[0];
            }
            out.push((format!("{name}-flip{round}"), sample));
        }
    }
    out
}

fn run_parser<T, F>(
    sample_name: &str,
    parser_name: &'static str,
    parser_hits: &mut BTreeMap<&'static str, u32>,
    coverage: &mut ErrorCoverage,
    parser: F,
) -> bool
where
    F: FnOnce() -> Result<T, ParseError>,
{
    let outcome = catch_unwind(AssertUnwindSafe(parser));
    let Ok(result) = outcome else {
        panic!("{parser_name} panicked on sample {sample_name}");
    };
    match result {
        Ok(_) => false,
        Err(err) => {
            coverage.observe(&err);
            *parser_hits.entry(parser_name).or_default() += 1;
            true
        }
    }
}

#[test]
fn adversarial_samples_never_panic() {
    let mut rng = Rng(0x2545_F491);
    let corpus = build_corpus(&mut rng);
    assert!(corpus.len() >= 50, "corpus too small: {}", corpus.len());

    let mut parser_hits = BTreeMap::new();
    let mut coverage = ErrorCoverage::default();

    for (name, data) in &corpus {
        run_parser(name, "superblock", &mut parser_hits, &mut coverage, || {
            Ext2Superblock::parse_superblock_region(data)
        });
        run_parser(name, "geometry", &mut parser_hits, &mut coverage, || {
            Ext2Superblock::parse_superblock_region(data).and_then(|sb| sb.validate_geometry())
        });
        run_parser(name, "group_desc", &mut parser_hits, &mut coverage, || {
            Ext2GroupDesc::parse_from_bytes(data)
        });
        run_parser(name, "gdt", &mut parser_hits, &mut coverage, || {
            parse_group_desc_table(data, 64)
        });
        run_parser(name, "inode", &mut parser_hits, &mut coverage, || {
            Ext2Inode::parse_from_bytes(data)
        });
        run_parser(name, "dir_block", &mut parser_hits, &mut coverage, || {
            parse_dir_block(data)
        });
        run_parser(name, "dir_iter", &mut parser_hits, &mut coverage, || {
            iter_dir_block(data).collect::<Result<Vec<_>, _>>()
        });
    }

    assert!(coverage.insufficient_data > 0, "{coverage:?}");
    assert!(coverage.invalid_magic > 0, "{coverage:?}");
    assert!(coverage.invalid_field > 0, "{coverage:?}");
    assert!(parser_hits.contains_key("superblock"));
    assert!(parser_hits.contains_key("dir_block"));
}

#[test]
fn well_formed_seeds_parse_cleanly() {
    let sb = Ext2Superblock::parse_superblock_region(&valid_superblock_region())
        .expect("seed superblock");
    sb.validate_geometry().expect("seed geometry");

    let block = valid_dir_block();
    let entries = parse_dir_block(&block).expect("seed dir block");
    assert_eq!(entries.len(), 2);
    let span: usize = iter_dir_block(&block)
        .map(|record| usize::from(record.expect("seed record").1.rec_len))
        .sum();
    assert_eq!(span, 1024);
}

#[test]
fn superblock_serializes_to_json() {
    let sb = Ext2Superblock::parse_superblock_region(&valid_superblock_region()).unwrap();
    let json = serde_json::to_value(&sb).expect("json");
    assert_eq!(json["blocks_count"], 256);
    assert_eq!(json["magic"], u64::from(EXT2_SUPER_MAGIC));
}
