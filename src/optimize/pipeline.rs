//! Driving the whole optimization over a batch of methods
//!
//! Stages, per method:
//!
//!   1. decode the `Code` attribute (a method whose code is malformed is skipped, and every field
//!      it may write stops being constant)
//!   2. point member references at their declaring classes, if a resolver is available
//!   3. constant analysis, repeated for methods that relied on a field later found to be written
//!      (by any method of the batch, skipped or not) until no such method is left
//!   4. apply the analysis, cancel pops, reassign local slots, cancel pops again
//!   5. encode back into a `Code` attribute
//!
//! Nothing is transformed before the analyses of all methods have settled, since the facts of
//! one method can depend on field writes in another.

use super::{
    apply_constant_facts, remove_pops, LocalOptimizer, LocalStats, Settings, TransformStats,
};
use crate::analysis::{
    canonicalize_references, ConstantAnalysis, ConstantAnalyzer, IdentifierService, MethodContext,
};
use crate::jvm::class_file::{CodeAttribute, ConstantPool};
use crate::jvm::class_graph::MemberResolver;
use crate::jvm::code::opcodes::{PUTFIELD, PUTSTATIC};
use crate::jvm::code::{
    decode_code_attribute, encode_code_attribute, written_fields, InstructionGraph, MemberKind,
    Operand, Reference,
};
use crate::jvm::{Error, Result};
use log::{debug, info, warn};

/// A method, and the body the optimizer replaces
pub struct MethodBody {
    pub context: MethodContext,
    pub code: CodeAttribute,
}

impl MethodBody {
    pub fn new(context: MethodContext, code: CodeAttribute) -> MethodBody {
        MethodBody { context, code }
    }
}

/// What happened to one method
#[derive(Debug)]
pub enum MethodOutcome {
    Optimized(MethodStats),

    /// Left as it was
    Skipped(Error),
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub struct MethodStats {
    pub instructions_before: usize,
    pub instructions_after: usize,

    /// Number of times the constant analysis ran
    pub analyses: usize,

    pub transform: TransformStats,
    pub locals: Option<LocalStats>,
}

/// Method being worked on
struct Pending {
    graph: InstructionGraph,
    analysis: Option<ConstantAnalysis>,
    stats: MethodStats,
}

pub struct Optimizer<'a> {
    pub settings: Settings,
    service: &'a mut dyn IdentifierService,
    resolver: Option<&'a dyn MemberResolver>,
}

impl<'a> Optimizer<'a> {
    pub fn new(settings: Settings, service: &'a mut dyn IdentifierService) -> Optimizer<'a> {
        Optimizer {
            settings,
            service,
            resolver: None,
        }
    }

    /// Canonicalize member references against a class hierarchy before analysing
    pub fn with_resolver(mut self, resolver: &'a dyn MemberResolver) -> Optimizer<'a> {
        self.resolver = Some(resolver);
        self
    }

    /// Optimize one method on its own
    pub fn optimize_method(
        &mut self,
        method: &mut MethodBody,
        pool: &mut ConstantPool,
    ) -> Result<MethodStats> {
        let outcome = self.optimize_methods(std::slice::from_mut(method), pool)?;
        match outcome.into_iter().next() {
            Some(MethodOutcome::Optimized(stats)) => Ok(stats),
            Some(MethodOutcome::Skipped(err)) => Err(err),
            None => Ok(MethodStats::default()),
        }
    }

    /// Optimize a batch of methods sharing one constant pool
    ///
    /// Methods failing with a recoverable error are skipped and keep their code. Any other
    /// error aborts the whole batch.
    pub fn optimize_methods(
        &mut self,
        methods: &mut [MethodBody],
        pool: &mut ConstantPool,
    ) -> Result<Vec<MethodOutcome>> {
        let mut pending: Vec<Result<Pending>> = methods
            .iter()
            .map(|method| self.decode(method, &*pool))
            .collect();

        // Skipped methods keep their code, writes included
        for (method, slot) in methods.iter().zip(&pending) {
            if slot.is_err() {
                self.withdraw_fields(written_fields(&method.code, pool));
            }
        }

        if self.settings.fold_constants {
            for (method, slot) in methods.iter().zip(&mut pending) {
                self.analyze_or_skip(slot, &method.context);
            }
            self.reanalyze_stale(methods, &mut pending);
        }

        let mut outcomes = vec![];
        for (method, slot) in methods.iter_mut().zip(pending) {
            let outcome = match slot.and_then(|work| self.finish(work, method, pool)) {
                Ok(stats) => MethodOutcome::Optimized(stats),
                Err(err) if err.is_recoverable() => {
                    warn!("skipping {}: {}", method.context.reference(), err);
                    MethodOutcome::Skipped(err)
                }
                Err(err) => return Err(err),
            };
            outcomes.push(outcome);
        }
        info!(
            "optimized {} of {} methods",
            outcomes
                .iter()
                .filter(|outcome| matches!(outcome, MethodOutcome::Optimized(_)))
                .count(),
            outcomes.len()
        );
        Ok(outcomes)
    }

    fn decode(&self, method: &MethodBody, pool: &ConstantPool) -> Result<Pending> {
        let mut graph = decode_code_attribute(&method.code, pool)?;
        if let Some(resolver) = self.resolver {
            let changed = canonicalize_references(&mut graph, resolver);
            debug!("{}: {} references canonicalized", method.context.reference(), changed);
        }
        Ok(Pending {
            stats: MethodStats {
                instructions_before: graph.len(),
                ..MethodStats::default()
            },
            graph,
            analysis: None,
        })
    }

    fn analyze(&mut self, work: &mut Pending, context: &MethodContext) -> Result<()> {
        let analysis = ConstantAnalyzer::new(&mut *self.service)
            .with_order(self.settings.worklist_order)
            .with_pure_methods(self.settings.interpret_pure_methods)
            .analyze(&work.graph, context)?;
        work.analysis = Some(analysis);
        work.stats.analyses += 1;
        Ok(())
    }

    /// Analyse a decoded method, giving it up if the analysis fails
    fn analyze_or_skip(&mut self, slot: &mut Result<Pending>, context: &MethodContext) {
        let work = match slot {
            Ok(work) => work,
            Err(_) => return,
        };
        if let Err(err) = self.analyze(work, context) {
            let writes: Vec<Reference> = work
                .graph
                .iter()
                .filter_map(|id| match &work.graph.get(id).operand {
                    Operand::Field(field)
                        if matches!(work.graph.get(id).opcode, PUTSTATIC | PUTFIELD) =>
                    {
                        Some(field.clone())
                    }
                    _ => None,
                })
                .collect();
            self.withdraw_fields(writes);
            *slot = Err(err);
        }
    }

    /// Stop treating as constant fields that a skipped method may write
    ///
    /// Readers that already relied on one of them become stale.
    fn withdraw_fields(&mut self, fields: Vec<Reference>) {
        for field in fields {
            self.service.mark_field_not_constant(&field);
            let declaring = self
                .resolver
                .and_then(|resolver| resolver.declaring_class(MemberKind::Field, &field));
            if let Some(class) = declaring {
                if class != field.class {
                    let canonical = Reference::new(&class, &field.name, &field.descriptor);
                    self.service.mark_field_not_constant(&canonical);
                }
            }
        }
    }

    /// Analyse again the methods that read a field as constant before it was found to be written
    ///
    /// Every field can only be withdrawn once, so this ends.
    fn reanalyze_stale(&mut self, methods: &[MethodBody], pending: &mut [Result<Pending>]) {
        loop {
            let stale = self.service.take_stale_readers();
            if stale.is_empty() {
                return;
            }
            for (method, slot) in methods.iter().zip(pending.iter_mut()) {
                if slot.is_err() || !stale.contains(&method.context.reference()) {
                    continue;
                }
                debug!("analysing {} again", method.context.reference());
                self.analyze_or_skip(slot, &method.context);
            }
        }
    }

    /// Transform and encode one method
    fn finish(
        &self,
        mut work: Pending,
        method: &mut MethodBody,
        pool: &mut ConstantPool,
    ) -> Result<MethodStats> {
        let graph = &mut work.graph;
        let settings = &self.settings;
        if let Some(analysis) = &work.analysis {
            work.stats.transform = apply_constant_facts(graph, analysis)?;
        }
        if settings.remove_pops {
            work.stats.transform.pops_removed += remove_pops(graph)?;
        }
        if settings.optimize_locals {
            let locals = LocalOptimizer::new(settings.rebuild_local_variable_table)
                .optimize(graph, &method.context)?;
            work.stats.locals = Some(locals);
            if settings.remove_pops && locals.dead_stores > 0 {
                work.stats.transform.pops_removed += remove_pops(graph)?;
            }
        }
        if !settings.keep_line_numbers {
            graph.line_numbers = None;
        }

        method.code = encode_code_attribute(graph, pool)?;
        work.stats.instructions_after = graph.len();
        debug!(
            "{}: {} -> {} instructions",
            method.context.reference(),
            work.stats.instructions_before,
            work.stats.instructions_after
        );
        Ok(work.stats)
    }
}
