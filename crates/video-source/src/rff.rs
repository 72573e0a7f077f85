//! Repeat-field remapping
//!
//! Soft-telecined tracks announce extra fields through `repeat_pict`. The
//! remapper expands the native frames into the logical field sequence and
//! pairs fields back up into displayable frames, recording for each logical
//! frame which source frame supplies its top and bottom field.

use crate::index::FrameInfo;

/// Field pair: source frame for the top field, source frame for the bottom.
pub type FieldPair = (i64, i64);

/// Expand `frames` into the field-pair table of length `num_rff_frames`.
///
/// Walks the source frames emitting `repeat_pict + 2` fields each, alternating
/// parity from the frame's field order. If one parity runs a field short at
/// the end, the last field of the longer side is duplicated.
#[must_use]
pub fn build_field_table(frames: &[FrameInfo], num_rff_frames: i64) -> Vec<FieldPair> {
    let mut fields: Vec<FieldPair> = vec![(0, 0); num_rff_frames as usize];
    let mut dest_top = 0usize;
    let mut dest_bottom = 0usize;

    for (n, frame) in frames.iter().enumerate() {
        let n = n as i64;
        let count = frame.repeat_pict + 2;
        let mut top = frame.top_field_first;
        for _ in 0..count {
            if top {
                debug_assert!(dest_top <= dest_bottom);
                fields[dest_top].0 = n;
                dest_top += 1;
            } else {
                debug_assert!(dest_top >= dest_bottom);
                fields[dest_bottom].1 = n;
                dest_bottom += 1;
            }
            top = !top;
        }
    }

    // One parity may come up a field short; pad it from its own last field.
    if dest_top > dest_bottom {
        fields[dest_bottom].1 = fields[dest_bottom - 1].1;
        dest_bottom += 1;
    } else if dest_top < dest_bottom {
        fields[dest_top].0 = fields[dest_top - 1].0;
        dest_top += 1;
    }

    debug_assert_eq!(dest_top, dest_bottom);
    debug_assert_eq!(dest_top, fields.len());

    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::HASH_SIZE;

    fn frame(repeat_pict: i32, tff: bool) -> FrameInfo {
        FrameInfo {
            pts: 0,
            repeat_pict,
            key_frame: false,
            top_field_first: tff,
            hash: [0; HASH_SIZE],
        }
    }

    /// 3:2 pulldown: A(rp=1,tff) B(rp=0,bff) C(rp=1,bff) D(rp=0,tff) turns
    /// four film frames into five display frames AA AB BC CC DD.
    #[test]
    fn three_two_pulldown_cadence() {
        let frames = vec![
            frame(1, true),
            frame(0, false),
            frame(1, false),
            frame(0, true),
        ];
        let fields_total: i64 = frames.iter().map(|f| i64::from(f.repeat_pict) + 2).sum();
        assert_eq!(fields_total, 10);

        let table = build_field_table(&frames, (fields_total + 1) / 2);
        assert_eq!(table, vec![(0, 0), (0, 1), (1, 2), (2, 2), (3, 3)]);
    }

    #[test]
    fn progressive_track_maps_one_to_one() {
        let frames = vec![frame(0, true); 6];
        let table = build_field_table(&frames, 6);
        assert_eq!(table.len(), 6);
        for (n, pair) in table.iter().enumerate() {
            assert_eq!(*pair, (n as i64, n as i64));
        }
    }

    #[test]
    fn odd_field_total_pads_one_parity() {
        // A single frame with three fields: T B T, bottom padded from itself.
        let frames = vec![frame(1, true)];
        let table = build_field_table(&frames, 2);
        assert_eq!(table, vec![(0, 0), (0, 0)]);
    }

    #[test]
    fn field_conservation() {
        // Parity-coherent cadence with a double repeat in the middle.
        let frames = vec![
            frame(1, true),
            frame(0, false),
            frame(2, false),
            frame(0, false),
            frame(1, false),
        ];
        let fields_total: i64 = frames.iter().map(|f| i64::from(f.repeat_pict) + 2).sum();
        assert_eq!(fields_total, 14);

        let table = build_field_table(&frames, (fields_total + 1) / 2);
        assert_eq!(
            table,
            vec![(0, 0), (0, 1), (1, 2), (2, 2), (2, 3), (3, 4), (4, 4)]
        );
        // Each logical frame consumes two fields, with at most one padded.
        assert!(2 * table.len() as i64 - fields_total <= 1);
    }
}
