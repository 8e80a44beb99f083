//! TaskRequest - デコードと検証
//!
//! デコードは構文のみ: 宣言されたセクション長の合計がパケット本体と
//! ぴったり一致すること。検証では名前を descriptor registry で解決し、
//! 問題ごとに専用のレスポンスコードへ対応させる。

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, BytesMut};

use super::error::ProtocolError;
use super::wire::{BodyReader, NO_TIMEOUT, TaskResponseCode};
use crate::domain::{Descriptors, FilterDesc, ImageFormat, RenderDesc};

const FLAG_RENDER: u16 = 1 << 0;
const FLAG_FILTER: u16 = 1 << 1;

/// `TaskRequest` as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TaskRequest {
    pub frame_no: u32,
    pub task_id: u32,
    pub has_render: bool,
    pub has_filter: bool,
    pub render_desc: String,
    pub filter_desc: String,
    pub oformat: String,
    pub width: u16,
    pub height: u16,
    pub render_timeout: Option<Duration>,
    pub filter_timeout: Option<Duration>,
    pub render_args: Vec<String>,
    pub filter_args: Vec<String>,
    /// Relative paths, exactly as sent.
    pub render_files: Vec<String>,
    pub filter_files: Vec<String>,
}

fn timeout_from_wire(ms: u32) -> Option<Duration> {
    (ms != NO_TIMEOUT).then(|| Duration::from_millis(u64::from(ms)))
}

fn timeout_to_wire(t: Option<Duration>) -> u32 {
    t.map_or(NO_TIMEOUT, |d| {
        u32::try_from(d.as_millis()).unwrap_or(NO_TIMEOUT - 1)
    })
}

fn join_args(args: &[String]) -> Vec<u8> {
    let mut out = Vec::new();
    for a in args {
        out.extend_from_slice(a.as_bytes());
        out.push(0);
    }
    out
}

impl TaskRequest {
    pub(crate) fn read(r: &mut BodyReader<'_>) -> Result<Self, ProtocolError> {
        let ptype = r.packet_type();
        let frame_no = r.u32()?;
        let task_id = r.u32()?;
        let render_desc_len = r.u16()? as usize;
        let filter_desc_len = r.u16()? as usize;
        let oformat_len = r.u16()? as usize;
        let width = r.u16()?;
        let height = r.u16()?;
        let render_timeout = timeout_from_wire(r.u32()?);
        let filter_timeout = timeout_from_wire(r.u32()?);
        let render_args_size = r.u32()? as usize;
        let filter_args_size = r.u32()? as usize;
        let render_add = r.u16()? as usize;
        let filter_add = r.u16()? as usize;
        let flags = r.u16()?;

        // Fixed sections must fit exactly before anything is interpreted.
        let fixed = render_desc_len + filter_desc_len + oformat_len + render_args_size
            + filter_args_size
            + 2 * (render_add + filter_add);
        if fixed > r.remaining() {
            return Err(ProtocolError::Malformed(ptype, "sections exceed packet length"));
        }

        let text = |b: &[u8]| {
            String::from_utf8(b.to_vec()).map_err(|_| ProtocolError::Malformed(ptype, "not utf-8"))
        };
        let args = |b: &[u8]| -> Result<Vec<String>, ProtocolError> {
            b.split(|&c| c == 0)
                .filter(|s| !s.is_empty())
                .map(|s| text(s))
                .collect()
        };

        let render_desc = text(r.bytes(render_desc_len)?)?;
        let filter_desc = text(r.bytes(filter_desc_len)?)?;
        let oformat = text(r.bytes(oformat_len)?)?;
        let render_args = args(r.bytes(render_args_size)?)?;
        let filter_args = args(r.bytes(filter_args_size)?)?;

        let mut files = Vec::with_capacity(render_add + filter_add);
        for _ in 0..render_add + filter_add {
            let len = r.u16()? as usize;
            files.push(text(r.bytes(len)?)?);
        }
        let filter_files = files.split_off(render_add);

        Ok(Self {
            frame_no,
            task_id,
            has_render: flags & FLAG_RENDER != 0,
            has_filter: flags & FLAG_FILTER != 0,
            render_desc,
            filter_desc,
            oformat,
            width,
            height,
            render_timeout,
            filter_timeout,
            render_args,
            filter_args,
            render_files: files,
            filter_files,
        })
    }

    pub(crate) fn put(&self, dst: &mut BytesMut) {
        let render_args = join_args(&self.render_args);
        let filter_args = join_args(&self.filter_args);
        let mut flags = 0;
        if self.has_render {
            flags |= FLAG_RENDER;
        }
        if self.has_filter {
            flags |= FLAG_FILTER;
        }

        dst.put_u32(self.frame_no);
        dst.put_u32(self.task_id);
        dst.put_u16(self.render_desc.len() as u16);
        dst.put_u16(self.filter_desc.len() as u16);
        dst.put_u16(self.oformat.len() as u16);
        dst.put_u16(self.width);
        dst.put_u16(self.height);
        dst.put_u32(timeout_to_wire(self.render_timeout));
        dst.put_u32(timeout_to_wire(self.filter_timeout));
        dst.put_u32(render_args.len() as u32);
        dst.put_u32(filter_args.len() as u32);
        dst.put_u16(self.render_files.len() as u16);
        dst.put_u16(self.filter_files.len() as u16);
        dst.put_u16(flags);

        dst.put_slice(self.render_desc.as_bytes());
        dst.put_slice(self.filter_desc.as_bytes());
        dst.put_slice(self.oformat.as_bytes());
        dst.put_slice(&render_args);
        dst.put_slice(&filter_args);
        for f in self.render_files.iter().chain(&self.filter_files) {
            dst.put_u16(f.len() as u16);
            dst.put_slice(f.as_bytes());
        }
    }
}

#[derive(Debug, Clone)]
pub struct ValidRender {
    pub desc: Arc<RenderDesc>,
    pub format: Arc<ImageFormat>,
    pub width: u16,
    pub height: u16,
    pub timeout: Option<Duration>,
    pub args: Vec<String>,
    pub add_files: Vec<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ValidFilter {
    pub desc: Arc<FilterDesc>,
    pub timeout: Option<Duration>,
    pub args: Vec<String>,
    pub add_files: Vec<PathBuf>,
}

/// A request whose names all resolved.
#[derive(Debug, Clone)]
pub struct ValidRequest {
    pub peer_task: u32,
    pub frame_no: u32,
    pub render: Option<ValidRender>,
    pub filter: Option<ValidFilter>,
    /// Output format; only optional for filter-only tasks.
    pub format: Option<Arc<ImageFormat>>,
}

/// Resolve names and check paths; the error is the code to answer with.
pub fn validate(req: &TaskRequest, d: &Descriptors) -> Result<ValidRequest, TaskResponseCode> {
    if !req.has_render && !req.has_filter {
        return Err(TaskResponseCode::NoStep);
    }

    let format = if req.oformat.is_empty() {
        None
    } else {
        Some(
            d.format(&req.oformat)
                .cloned()
                .ok_or(TaskResponseCode::UnknownOutputFormat)?,
        )
    };

    let render = if req.has_render {
        let desc = d
            .render(&req.render_desc)
            .cloned()
            .ok_or(TaskResponseCode::UnknownRender)?;
        let format = format.clone().ok_or(TaskResponseCode::UnknownOutputFormat)?;
        Some(ValidRender {
            desc,
            format,
            width: req.width,
            height: req.height,
            timeout: req.render_timeout,
            args: req.render_args.clone(),
            add_files: sanitize_all(&req.render_files)?,
        })
    } else if !req.render_files.is_empty() {
        return Err(TaskResponseCode::IllegalFile);
    } else {
        None
    };

    let filter = if req.has_filter {
        let desc = d
            .filter(&req.filter_desc)
            .cloned()
            .ok_or(TaskResponseCode::UnknownFilter)?;
        Some(ValidFilter {
            desc,
            timeout: req.filter_timeout,
            args: req.filter_args.clone(),
            add_files: sanitize_all(&req.filter_files)?,
        })
    } else if !req.filter_files.is_empty() {
        return Err(TaskResponseCode::IllegalFile);
    } else {
        None
    };

    Ok(ValidRequest {
        peer_task: req.task_id,
        frame_no: req.frame_no,
        render,
        filter,
        format,
    })
}

fn sanitize_all(names: &[String]) -> Result<Vec<PathBuf>, TaskResponseCode> {
    names.iter().map(|n| sanitize(n)).collect()
}

/// Accept only plain relative paths that stay below their base directory.
pub fn sanitize(name: &str) -> Result<PathBuf, TaskResponseCode> {
    if name.is_empty() || name.contains('\0') {
        return Err(TaskResponseCode::IllegalFile);
    }
    let path = Path::new(name);
    let mut out = PathBuf::new();
    for c in path.components() {
        match c {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(TaskResponseCode::IllegalFile);
            }
        }
    }
    if out.as_os_str().is_empty() {
        return Err(TaskResponseCode::IllegalFile);
    }
    Ok(out)
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn descriptors() -> Descriptors {
        let mut d = Descriptors::with_builtin_formats();
        d.register_render(RenderDesc {
            name: "povray".into(),
            binary: "/bin/sh".into(),
            required_args: vec![],
        })
        .unwrap();
        d.register_filter(FilterDesc {
            name: "gamma".into(),
            binary: "/bin/sh".into(),
            required_args: vec![],
        })
        .unwrap();
        d
    }

    pub fn render_request(frame_no: u32, task_id: u32) -> TaskRequest {
        TaskRequest {
            frame_no,
            task_id,
            has_render: true,
            render_desc: "povray".into(),
            oformat: "png".into(),
            width: 64,
            height: 48,
            render_args: vec!["+Q9".into(), "+A".into()],
            ..TaskRequest::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use crate::ldr::wire::{HEADER_LEN, Packet, PacketType};
    use rstest::rstest;

    fn body(req: &TaskRequest) -> BytesMut {
        let mut buf = BytesMut::new();
        Packet::TaskRequest(req.clone()).encode(&mut buf).unwrap();
        buf.split_off(HEADER_LEN)
    }

    #[test]
    fn decodes_sections_in_order() {
        let mut req = render_request(7, 70);
        req.has_filter = true;
        req.filter_desc = "gamma".into();
        req.filter_args = vec!["2.2".into()];
        req.render_files = vec!["tex/wood.png".into()];
        req.filter_files = vec!["lut.bin".into(), "x/y.cfg".into()];
        req.filter_timeout = Some(Duration::from_secs(5));

        let decoded = Packet::decode(PacketType::TaskRequest, &body(&req)).unwrap();
        assert_eq!(decoded, Packet::TaskRequest(req));
    }

    #[test]
    fn trailing_byte_is_a_length_mismatch() {
        let mut b = body(&render_request(1, 1));
        b.put_u8(0);
        assert!(matches!(
            Packet::decode(PacketType::TaskRequest, &b),
            Err(ProtocolError::Trailing(PacketType::TaskRequest, 1))
        ));
    }

    #[test]
    fn missing_byte_is_a_length_mismatch() {
        let b = body(&render_request(1, 1));
        assert!(Packet::decode(PacketType::TaskRequest, &b[..b.len() - 1]).is_err());
    }

    #[test]
    fn oversized_section_length_is_rejected() {
        let mut b = body(&render_request(1, 1));
        // render_args_size
        b[26..30].copy_from_slice(&u32::MAX.to_be_bytes());
        assert!(matches!(
            Packet::decode(PacketType::TaskRequest, &b),
            Err(ProtocolError::Malformed(_, _))
        ));
    }

    #[rstest]
    #[case::no_step(|r: &mut TaskRequest| r.has_render = false, TaskResponseCode::NoStep)]
    #[case::unknown_render(|r: &mut TaskRequest| r.render_desc = "blender".into(), TaskResponseCode::UnknownRender)]
    #[case::unknown_format(|r: &mut TaskRequest| r.oformat = "exr".into(), TaskResponseCode::UnknownOutputFormat)]
    #[case::missing_format(|r: &mut TaskRequest| r.oformat.clear(), TaskResponseCode::UnknownOutputFormat)]
    #[case::unknown_filter(|r: &mut TaskRequest| { r.has_filter = true; r.filter_desc = "blur".into() }, TaskResponseCode::UnknownFilter)]
    #[case::escaping_path(|r: &mut TaskRequest| r.render_files = vec!["../etc/passwd".into()], TaskResponseCode::IllegalFile)]
    #[case::absolute_path(|r: &mut TaskRequest| r.render_files = vec!["/etc/passwd".into()], TaskResponseCode::IllegalFile)]
    fn semantic_rejections_have_specific_codes(
        #[case] tweak: fn(&mut TaskRequest),
        #[case] expected: TaskResponseCode,
    ) {
        let mut req = render_request(3, 30);
        tweak(&mut req);
        assert_eq!(validate(&req, &descriptors()).unwrap_err(), expected);
    }

    #[test]
    fn filter_only_request_needs_no_format() {
        let req = TaskRequest {
            frame_no: 4,
            task_id: 40,
            has_filter: true,
            filter_desc: "gamma".into(),
            ..TaskRequest::default()
        };
        let v = validate(&req, &descriptors()).unwrap();
        assert!(v.render.is_none());
        assert!(v.format.is_none());
        assert_eq!(v.filter.unwrap().desc.name, "gamma");
    }

    #[test]
    fn sanitize_strips_current_dir() {
        assert_eq!(sanitize("./a/./b.png").unwrap(), PathBuf::from("a/b.png"));
        assert!(sanitize(".").is_err());
    }
}
