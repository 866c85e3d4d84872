//! Kernel-side trace material injected after syscall markers.
//!
//! Two sources exist. Templates are record sequences captured once from a
//! representative execution of each syscall and replayed verbatim. A
//! [`KernelTraceDecoder`], when configured, converts a per-syscall kernel
//! capture instead; template replay is the fallback.

use trace_format::record::{RecordIter, TraceMarker, TraceRecord};
use trace_format::FileType;

use crate::error::ConvertError;

/// One syscall's pre-captured record sequence.
#[derive(Debug, Clone)]
pub struct SyscallTemplate {
    pub records: Vec<TraceRecord>,
    pub instr_count: u64,
}

/// Immutable syscall-number to template mapping, loaded before conversion.
#[derive(Debug, Default)]
pub struct SyscallTemplates {
    templates: hashbrown::HashMap<u64, SyscallTemplate>,
}

impl SyscallTemplates {
    /// Parses a template collection from its serialized record stream.
    ///
    /// The stream is ordinary trace-format records: a header whose file type
    /// carries [`FileType::SYSCALL_TEMPLATES`], then for each syscall a
    /// `SyscallTraceStart` marker, the template's records, and the matching
    /// `SyscallTraceEnd` marker, closed by a footer.
    pub fn load(bytes: &[u8]) -> Result<Self, ConvertError> {
        let mut iter = RecordIter::new(bytes);
        match iter.next() {
            Some(Ok(TraceRecord::Header { file_type, .. }))
                if FileType::from_bits_truncate(file_type)
                    .contains(FileType::SYSCALL_TEMPLATES) => {}
            Some(Ok(_)) | None => {
                return Err(ConvertError::Template(
                    "not a syscall template collection".into(),
                ))
            }
            Some(Err(e)) => return Err(e.into()),
        }

        let mut templates = hashbrown::HashMap::new();
        let mut open: Option<(u64, SyscallTemplate)> = None;
        for record in iter {
            let record = record?;
            match record {
                TraceRecord::Marker {
                    kind: TraceMarker::SyscallTraceStart,
                    value,
                } => {
                    if open.is_some() {
                        return Err(ConvertError::Template(format!(
                            "template for syscall {value} opened inside another"
                        )));
                    }
                    open = Some((
                        value,
                        SyscallTemplate {
                            records: Vec::new(),
                            instr_count: 0,
                        },
                    ));
                }
                TraceRecord::Marker {
                    kind: TraceMarker::SyscallTraceEnd,
                    value,
                } => match open.take() {
                    Some((sysnum, template)) if sysnum == value => {
                        templates.insert(sysnum, template);
                    }
                    Some((sysnum, _)) => {
                        return Err(ConvertError::Template(format!(
                            "template for syscall {sysnum} closed as {value}"
                        )))
                    }
                    None => {
                        return Err(ConvertError::Template(format!(
                            "unopened template for syscall {value} closed"
                        )))
                    }
                },
                TraceRecord::Footer => break,
                record => match &mut open {
                    Some((_, template)) => {
                        if record.is_instr() {
                            template.instr_count += 1;
                        }
                        template.records.push(record);
                    }
                    None => {
                        return Err(ConvertError::Template(
                            "record outside any template".into(),
                        ))
                    }
                },
            }
        }
        if let Some((sysnum, _)) = open {
            return Err(ConvertError::Template(format!(
                "template for syscall {sysnum} never closed"
            )));
        }
        Ok(Self { templates })
    }

    pub fn get(&self, sysnum: u64) -> Option<&SyscallTemplate> {
        self.templates.get(&sysnum)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

/// Outcome of decoding one syscall's kernel capture.
#[derive(Debug, Clone)]
pub struct SyscallTraceResult {
    pub records: Vec<TraceRecord>,
    pub instr_count: u64,
    /// Decode errors survived while producing the records.
    pub non_fatal_errors: u64,
    /// PC discontinuities the errors left behind.
    pub discontinuities: u64,
}

/// Optional capability for decoding captured kernel execution, selected at
/// converter construction.
///
/// `Ok(None)` means no capture exists for this syscall invocation; an error
/// degrades that one injection, never the thread.
pub trait KernelTraceDecoder: Send + Sync {
    fn decode_syscall(
        &self,
        tid: u64,
        sysnum: u64,
    ) -> Result<Option<SyscallTraceResult>, ConvertError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use trace_format::record::InstrKind;
    use trace_format::TRACE_FORMAT_VERSION;

    fn template_stream() -> Vec<u8> {
        let mut bytes = Vec::new();
        let records = [
            TraceRecord::Header {
                version: TRACE_FORMAT_VERSION,
                file_type: FileType::SYSCALL_TEMPLATES.bits(),
            },
            TraceRecord::Marker {
                kind: TraceMarker::SyscallTraceStart,
                value: 5,
            },
            TraceRecord::Instr {
                kind: InstrKind::Plain,
                length: 4,
                pc: 0xffff_8000_0000_0000,
            },
            TraceRecord::Instr {
                kind: InstrKind::Return,
                length: 1,
                pc: 0xffff_8000_0000_0004,
            },
            TraceRecord::Marker {
                kind: TraceMarker::SyscallTraceEnd,
                value: 5,
            },
            TraceRecord::Footer,
        ];
        for record in records {
            record.emit(&mut bytes);
        }
        bytes
    }

    #[test]
    fn templates_load_with_instruction_counts() {
        let templates = SyscallTemplates::load(&template_stream()).unwrap();
        assert_eq!(templates.len(), 1);
        let template = templates.get(5).unwrap();
        assert_eq!(template.instr_count, 2);
        assert_eq!(template.records.len(), 2);
        assert!(templates.get(6).is_none());
    }

    #[test]
    fn non_template_streams_are_rejected() {
        let mut bytes = Vec::new();
        TraceRecord::Header {
            version: TRACE_FORMAT_VERSION,
            file_type: 0,
        }
        .emit(&mut bytes);
        assert!(matches!(
            SyscallTemplates::load(&bytes),
            Err(ConvertError::Template(_))
        ));
    }

    #[test]
    fn unterminated_templates_are_rejected() {
        let mut bytes = Vec::new();
        TraceRecord::Header {
            version: TRACE_FORMAT_VERSION,
            file_type: FileType::SYSCALL_TEMPLATES.bits(),
        }
        .emit(&mut bytes);
        TraceRecord::Marker {
            kind: TraceMarker::SyscallTraceStart,
            value: 9,
        }
        .emit(&mut bytes);
        TraceRecord::Footer.emit(&mut bytes);
        assert!(matches!(
            SyscallTemplates::load(&bytes),
            Err(ConvertError::Template(_))
        ));
    }
}
