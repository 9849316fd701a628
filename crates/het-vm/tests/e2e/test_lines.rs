use super::helpers::*;
use het_core::limits::ABS_LINE_INFO;
use het_core::number::chunk_id;
use het_core::proto::{AbsLineInfo, Instruction, LineInfoBuilder, Proto};

fn compiled(lines: &[i32], line_defined: i32) -> Proto {
    let mut p = Proto {
        line_defined,
        ..Proto::default()
    };
    let mut builder = LineInfoBuilder::new(line_defined);
    for (pc, &line) in lines.iter().enumerate() {
        p.emit(Instruction(pc as u32), line, &mut builder);
    }
    p
}

#[test]
fn test_mixed_deltas_and_anchors() {
    let mut lines = vec![10, 10, 10, 11, 11, 50, 50, 3000, 2, 2];
    lines.extend((0..400).map(|i| 2 + i / 7));
    let p = compiled(&lines, 10);
    for (pc, &line) in lines.iter().enumerate() {
        assert_eq!(p.line_for_pc(pc), Some(line), "pc {pc}");
    }
    assert!(p.abs_line_info.len() >= 3);
}

#[test]
fn test_lines_survive_dump_and_load() {
    let lines: Vec<i32> = (0..300).map(|i| 1 + (i * 37) % 500).collect();
    let mut s = new_state();
    let proto = s.heap_mut().new_proto(compiled(&lines, 1)).unwrap();
    let cl = s.heap_mut().new_lclosure(proto).unwrap();
    let bytes = s.dump(cl, false);
    let loaded = s.load(&bytes, "=lines").unwrap();
    let q = s.heap().get(loaded).proto;
    for (pc, &line) in lines.iter().enumerate() {
        assert_eq!(s.heap().get(q).line_for_pc(pc), Some(line));
    }
}

#[test]
fn test_hand_built_anchor_survives_dump_and_load() {
    let p = Proto {
        line_defined: 10,
        code: vec![Instruction(0); 7],
        line_info: vec![0, 0, 0, 1, 0, ABS_LINE_INFO, 0],
        abs_line_info: vec![AbsLineInfo { pc: 5, line: 50 }],
        ..Proto::default()
    };
    let expected = [10, 10, 10, 11, 11, 50, 50];
    let mut s = new_state();
    let proto = s.heap_mut().new_proto(p).unwrap();
    let cl = s.heap_mut().new_lclosure(proto).unwrap();
    let bytes = s.dump(cl, false);
    let loaded = s.load(&bytes, "=anchor").unwrap();
    let q = s.heap().get(s.heap().get(loaded).proto);
    assert_eq!(q.line_info, vec![0, 0, 0, 1, 0, ABS_LINE_INFO, 0]);
    assert_eq!(q.abs_line_info, vec![AbsLineInfo { pc: 5, line: 50 }]);
    let got: Vec<i32> = (0..7).map(|pc| q.line_for_pc(pc).unwrap()).collect();
    assert_eq!(got, expected);
    assert_eq!(q.line_for_pc(4), Some(11));
}

#[test]
fn test_chunk_id_forms() {
    assert_eq!(chunk_id(b"=stdin"), "stdin");
    assert_eq!(chunk_id(b"@main.het"), "main.het");
    assert_eq!(chunk_id(b"x = 1"), "[string \"x = 1\"]");
    assert_eq!(chunk_id(b"line one\nline two"), "[string \"line one...\"]");
}
